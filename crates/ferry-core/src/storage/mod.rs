//! Uniform storage contract over local and remote destinations.
//!
//! Transports expose a small set of wire primitives; `Storage` layers the
//! delivery and rotation semantics on top, so every destination behaves the
//! same regardless of protocol. Capabilities a transport lacks surface as
//! typed [`FerryError::Unsupported`] values, never as panics.

pub mod local;
pub mod remote;

use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{FerryError, Result};
use crate::job::{DumpObject, JobType};
use crate::naming::{self, DeliveryPlan};
use crate::retention::Retention;
use crate::rotate;

/// How a transport realises symlinks.
///
/// `Native` is a real filesystem symlink. `Marker` is a zero-byte object
/// carrying the target key in user metadata (S3-style); rotation treats it
/// as a link. `Copy` stores a full second copy, so the bucket graph has no
/// edges and rotation degrades to plain per-bucket deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymlinkMode {
    Native,
    Marker,
    Copy,
}

/// One directory entry as seen by a transport.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub mtime: DateTime<Utc>,
    pub size: u64,
    pub is_dir: bool,
    pub is_link: bool,
}

/// Wire primitives each destination protocol implements. Paths are
/// `/`-separated strings; how they map to the wire is the transport's
/// business.
pub trait Transport: Send {
    fn kind(&self) -> &'static str;

    fn is_local(&self) -> bool {
        false
    }

    fn symlink_mode(&self) -> SymlinkMode;

    /// Create a directory and all parents. Must be idempotent.
    fn mkdir_all(&self, path: &str) -> Result<()>;

    /// Upload a local file, throttled to `rate_limit` bytes/s.
    fn upload(&self, src: &Path, dst: &str, rate_limit: u64) -> Result<()>;

    /// Create a link at `link` pointing at `target` (relative to the link's
    /// directory), using whatever this transport's [`SymlinkMode`] allows.
    fn symlink(&self, target: &str, link: &str) -> Result<()>;

    /// Read a link's target. Only meaningful for `Native`/`Marker` modes.
    fn read_link(&self, path: &str) -> Result<String>;

    /// List one directory. A missing directory reads as empty.
    fn read_dir(&self, path: &str) -> Result<Vec<FileEntry>>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn remove(&self, path: &str) -> Result<()>;

    fn remove_all(&self, path: &str) -> Result<()>;

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Release the session. Default is a no-op for stateless transports.
    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn clone_transport(&self) -> Box<dyn Transport>;
}

/// A delivery destination: a transport plus the policy bound to it.
pub struct Storage {
    name: String,
    backup_path: String,
    rate_limit: u64,
    rotate_enabled: bool,
    retention: Retention,
    transport: Box<dyn Transport>,
}

impl Storage {
    pub fn new(
        name: impl Into<String>,
        backup_path: impl Into<String>,
        rate_limit: u64,
        rotate_enabled: bool,
        retention: Retention,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            backup_path: backup_path.into(),
            rate_limit,
            rotate_enabled,
            retention,
            transport,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_local(&self) -> bool {
        self.transport.is_local()
    }

    pub fn backup_path(&self) -> &str {
        &self.backup_path
    }

    /// Independent handle over the same destination. Rotation mutates path
    /// state per target, so each worker clones rather than shares.
    pub fn clone_handle(&self) -> Storage {
        Storage {
            name: self.name.clone(),
            backup_path: self.backup_path.clone(),
            rate_limit: self.rate_limit,
            rotate_enabled: self.rotate_enabled,
            retention: self.retention.clone(),
            transport: self.transport.clone_transport(),
        }
    }

    fn plan_for(&self, dump: &DumpObject, ofs: &str, kind: JobType, now: DateTime<Utc>) -> Result<DeliveryPlan> {
        let artifact_name = dump
            .tmp_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| FerryError::Config(format!("bad tmp artifact: {:?}", dump.tmp_file)))?;

        if kind.is_incremental() {
            let gzip = artifact_name.ends_with(".gz");
            Ok(naming::incremental_plan(
                ofs,
                &self.backup_path,
                gzip,
                dump.year_base,
                now,
            ))
        } else {
            Ok(naming::descending_plan(
                &artifact_name,
                ofs,
                &self.backup_path,
                &self.retention,
                now,
            ))
        }
    }

    /// Upload one artifact (and sidecar) and thread the bucket links.
    pub fn deliver(
        &self,
        dump: &DumpObject,
        ofs: &str,
        kind: JobType,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let plan = self.plan_for(dump, ofs, kind, now)?;

        let upload_err = |e: FerryError| FerryError::UploadFailed {
            storage: self.name.clone(),
            reason: e.to_string(),
        };

        self.transport
            .mkdir_all(naming::remote_parent(&plan.dst))
            .map_err(upload_err)?;

        if let Some(meta_dst) = &plan.metadata_dst {
            let meta_file = dump.metadata_file.as_ref().ok_or_else(|| {
                FerryError::UploadFailed {
                    storage: self.name.clone(),
                    reason: "incremental artifact without metadata sidecar".into(),
                }
            })?;
            self.transport
                .upload(meta_file, meta_dst, self.rate_limit)
                .map_err(upload_err)?;
        }

        self.transport
            .upload(&dump.tmp_file, &plan.dst, self.rate_limit)
            .map_err(upload_err)?;

        for (link, target) in &plan.links {
            self.transport
                .mkdir_all(naming::remote_parent(link))
                .map_err(upload_err)?;
            self.transport.symlink(target, link).map_err(upload_err)?;
        }

        info!(
            storage = %self.name,
            dst = %plan.dst,
            links = plan.links.len(),
            "backup delivered"
        );
        Ok(())
    }

    /// Apply retention for one OFS. `full` removes stale incremental years
    /// wholesale (year rollover).
    pub fn delete_old_backups(
        &self,
        kind: JobType,
        ofs: &str,
        safety: bool,
        full: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.rotate_enabled {
            debug!(storage = %self.name, ofs, "rotation disabled by config");
            return Ok(());
        }

        let outcome = if kind.is_incremental() {
            rotate::delete_incremental(
                self.transport.as_ref(),
                &self.backup_path,
                ofs,
                self.retention.months,
                full,
                now,
            )
        } else {
            rotate::delete_descending(
                self.transport.as_ref(),
                &self.backup_path,
                ofs,
                &self.retention,
                safety,
                now,
            )
        };

        outcome.into_result().map_err(|e| FerryError::RotateFailed {
            storage: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// All backup files below an OFS, recursively, files only.
    pub fn list_backups(&self, ofs: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(naming::join_remote(&[&self.backup_path, ofs]));

        while let Some(dir) = queue.pop_front() {
            for entry in self.transport.read_dir(&dir)? {
                let path = naming::join_remote(&[&dir, &entry.name]);
                if entry.is_dir {
                    queue.push_back(path);
                } else {
                    out.push(path);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Stream one stored backup, for external tooling.
    pub fn file_reader(&self, ofs_path: &str) -> Result<Box<dyn Read + Send>> {
        self.transport
            .open_read(&naming::join_remote(&[&self.backup_path, ofs_path]))
    }

    pub fn close(&self) -> Result<()> {
        self.transport.close()
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("name", &self.name)
            .field("kind", &self.transport.kind())
            .field("backup_path", &self.backup_path)
            .field("rotate_enabled", &self.rotate_enabled)
            .finish()
    }
}
