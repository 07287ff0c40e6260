use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FerryError>;

#[derive(Debug, Error)]
pub enum FerryError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("required binary missing: {0}")]
    PrereqMissing(String),

    #[error("source connect failed for '{source_name}': {reason}")]
    SourceConnect { source_name: String, reason: String },

    #[error("dump of '{target}' failed: {reason}")]
    DumpFailed { target: String, reason: String },

    #[error("tar exited with code {code}: {stderr}")]
    PackFailed { code: i32, stderr: String },

    #[error("storage '{storage}' unavailable: {reason}")]
    StorageUnavailable { storage: String, reason: String },

    #[error("upload to '{storage}' failed: {reason}")]
    UploadFailed { storage: String, reason: String },

    #[error("rotation on '{storage}' failed: {reason}")]
    RotateFailed { storage: String, reason: String },

    #[error("cleanup failed: {0}")]
    CleanupFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("'{0}' is not supported by this storage")]
    Unsupported(&'static str),

    #[error("storage I/O error: {0}")]
    Storage(#[source] Box<opendal::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl From<opendal::Error> for FerryError {
    fn from(value: opendal::Error) -> Self {
        FerryError::Storage(Box::new(value))
    }
}

impl FerryError {
    /// Errors that abort the whole run rather than a single target.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FerryError::Config(_) | FerryError::PrereqMissing(_) | FerryError::Cancelled
        )
    }
}

/// Accumulates per-target and per-storage failures without aborting the
/// surrounding loop. Nested multi-errors are flattened on push.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<FerryError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: FerryError) {
        match err {
            FerryError::Multi(inner) => self.errors.extend(inner.errors),
            other => self.errors.push(other),
        }
    }

    /// Record a failure and return the success value, if any.
    pub fn absorb<T>(&mut self, res: Result<T>) -> Option<T> {
        match res {
            Ok(v) => Some(v),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[FerryError] {
        &self.errors
    }

    pub fn contains_cancelled(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, FerryError::Cancelled))
    }

    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(FerryError::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.errors[0]),
            n => {
                writeln!(f, "{n} errors occurred:")?;
                for err in &self.errors {
                    writeln!(f, "  * {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

impl From<FerryError> for MultiError {
    fn from(err: FerryError) -> Self {
        let mut m = MultiError::new();
        m.push(err);
        m
    }
}
