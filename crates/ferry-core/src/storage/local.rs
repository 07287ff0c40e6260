//! Filesystem transport, also used for kernel-mounted SMB/NFS shares.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::limits::limited_file_reader;
use crate::storage::{FileEntry, SymlinkMode, Transport};

pub struct LocalTransport {
    kind: &'static str,
    local: bool,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            kind: "local",
            local: true,
        }
    }

    /// A share mounted by the kernel: same primitives, but counts as a
    /// remote destination for delivery accounting.
    pub fn mounted(kind: &'static str) -> Self {
        Self { kind, local: false }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn mtime_of(meta: &fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

impl Transport for LocalTransport {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn symlink_mode(&self) -> SymlinkMode {
        SymlinkMode::Native
    }

    fn mkdir_all(&self, path: &str) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn upload(&self, src: &Path, dst: &str, rate_limit: u64) -> Result<()> {
        let mut reader = limited_file_reader(src, rate_limit)?;
        let mut out = fs::File::create(dst)?;
        let mut buf = [0u8; 128 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
        }
        out.flush()?;
        Ok(())
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        match fs::symlink_metadata(link) {
            Ok(_) => fs::remove_file(link)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::os::unix::fs::symlink(target, link)?;
        Ok(())
    }

    fn read_link(&self, path: &str) -> Result<String> {
        Ok(fs::read_link(path)?.to_string_lossy().into_owned())
    }

    fn read_dir(&self, path: &str) -> Result<Vec<FileEntry>> {
        let iter = match fs::read_dir(path) {
            Ok(iter) => iter,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for entry in iter {
            let entry = entry?;
            // lstat: a link's own mtime orders it, and dangling links must
            // still list.
            let meta = fs::symlink_metadata(entry.path())?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                mtime: mtime_of(&meta),
                size: meta.len(),
                is_dir: meta.file_type().is_dir(),
                is_link: meta.file_type().is_symlink(),
            });
        }
        Ok(entries)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_all(&self, path: &str) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(PathBuf::from(path))?))
    }

    fn clone_transport(&self) -> Box<dyn Transport> {
        Box::new(Self {
            kind: self.kind,
            local: self.local,
        })
    }
}
