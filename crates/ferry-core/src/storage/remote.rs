//! Remote transports over opendal (S3, SFTP, FTP, WebDAV).
//!
//! Object stores have no symlinks; S3 emulates them with zero-byte marker
//! objects whose user metadata carries the target key, the rest fall back
//! to full copies. Rotation consults the advertised [`SymlinkMode`].

use std::io::Read;
use std::path::Path;

use opendal::{BlockingOperator, Operator};

use crate::error::{FerryError, Result};
use crate::limits::limited_file_reader;
use crate::naming;
use crate::storage::{FileEntry, SymlinkMode, Transport};

/// User-metadata key holding a marker object's link target.
const LINK_TARGET_META: &str = "ferry-symlink-target";

pub struct RemoteTransport {
    op: BlockingOperator,
    kind: &'static str,
    mode: SymlinkMode,
}

fn init_err(kind: &str, e: opendal::Error) -> FerryError {
    FerryError::StorageUnavailable {
        storage: kind.to_string(),
        reason: e.to_string(),
    }
}

impl RemoteTransport {
    pub fn s3(
        bucket: &str,
        region: &str,
        endpoint: Option<&str>,
        access_key_id: &str,
        secret_access_key: &str,
    ) -> Result<Self> {
        let mut builder = opendal::services::S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key_id)
            .secret_access_key(secret_access_key);
        if let Some(ep) = endpoint {
            builder = builder.endpoint(ep);
        }
        let op = Operator::new(builder)
            .map_err(|e| init_err("s3", e))?
            .finish()
            .blocking();
        Ok(Self {
            op,
            kind: "s3",
            mode: SymlinkMode::Marker,
        })
    }

    pub fn sftp(host: &str, port: u16, user: &str, key_file: Option<&str>) -> Result<Self> {
        let mut builder = opendal::services::Sftp::default()
            .endpoint(&format!("ssh://{host}:{port}"))
            .user(user);
        if let Some(key) = key_file {
            builder = builder.key(key);
        }
        let op = Operator::new(builder)
            .map_err(|e| init_err("sftp", e))?
            .finish()
            .blocking();
        Ok(Self {
            op,
            kind: "sftp",
            mode: SymlinkMode::Copy,
        })
    }

    pub fn ftp(host: &str, port: u16, user: &str, password: &str) -> Result<Self> {
        let builder = opendal::services::Ftp::default()
            .endpoint(&format!("ftp://{host}:{port}"))
            .user(user)
            .password(password);
        let op = Operator::new(builder)
            .map_err(|e| init_err("ftp", e))?
            .finish()
            .blocking();
        Ok(Self {
            op,
            kind: "ftp",
            mode: SymlinkMode::Copy,
        })
    }

    pub fn webdav(endpoint: &str, user: &str, password: &str) -> Result<Self> {
        let builder = opendal::services::Webdav::default()
            .endpoint(endpoint)
            .username(user)
            .password(password);
        let op = Operator::new(builder)
            .map_err(|e| init_err("webdav", e))?
            .finish()
            .blocking();
        Ok(Self {
            op,
            kind: "webdav",
            mode: SymlinkMode::Copy,
        })
    }

    fn marker_target(&self, path: &str) -> Result<Option<String>> {
        match self.op.stat(path) {
            Ok(meta) => Ok(meta
                .user_metadata()
                .and_then(|m| m.get(LINK_TARGET_META))
                .cloned()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Transport for RemoteTransport {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn symlink_mode(&self) -> SymlinkMode {
        self.mode
    }

    fn mkdir_all(&self, path: &str) -> Result<()> {
        self.op.create_dir(&format!("{}/", path.trim_end_matches('/')))?;
        Ok(())
    }

    fn upload(&self, src: &Path, dst: &str, rate_limit: u64) -> Result<()> {
        let mut reader = limited_file_reader(src, rate_limit)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        self.op.write(dst, data)?;
        Ok(())
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        match self.mode {
            SymlinkMode::Marker => {
                self.op
                    .write_with(link, Vec::new())
                    .user_metadata([(LINK_TARGET_META.to_string(), target.to_string())])
                    .call()?;
                Ok(())
            }
            SymlinkMode::Copy => {
                let src = naming::resolve_link(naming::remote_parent(link), target);
                self.op.copy(&src, link)?;
                Ok(())
            }
            SymlinkMode::Native => Err(FerryError::Unsupported("native symlink")),
        }
    }

    fn read_link(&self, path: &str) -> Result<String> {
        match self.mode {
            SymlinkMode::Marker => self
                .marker_target(path)?
                .ok_or(FerryError::Unsupported("read_link on non-marker object")),
            _ => Err(FerryError::Unsupported("read_link")),
        }
    }

    fn read_dir(&self, path: &str) -> Result<Vec<FileEntry>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let listing = match self.op.list(&prefix) {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in listing {
            let name = entry
                .path()
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            if name.is_empty() || entry.path() == prefix {
                continue;
            }

            let meta = entry.metadata();
            let is_dir = meta.is_dir();
            let (size, mtime) = if is_dir {
                (0, chrono::Utc::now())
            } else {
                // Listings may omit stat fields; fetch them when absent.
                let meta = if meta.last_modified().is_none() {
                    self.op.stat(entry.path())?
                } else {
                    meta.clone()
                };
                (
                    meta.content_length(),
                    meta.last_modified().unwrap_or_else(chrono::Utc::now),
                )
            };

            // Zero-byte objects are the only marker candidates; confirm via
            // user metadata before reporting a link.
            let is_link = !is_dir
                && size == 0
                && self.mode == SymlinkMode::Marker
                && self.marker_target(entry.path())?.is_some();

            out.push(FileEntry {
                name,
                mtime,
                size,
                is_dir,
                is_link,
            });
        }
        Ok(out)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.op.rename(from, to).map_err(|e| {
            if e.kind() == opendal::ErrorKind::Unsupported {
                FerryError::Unsupported("rename")
            } else {
                e.into()
            }
        })
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.op.delete(path)?;
        Ok(())
    }

    fn remove_all(&self, path: &str) -> Result<()> {
        self.op
            .remove_all(&format!("{}/", path.trim_end_matches('/')))?;
        Ok(())
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let data = self.op.read(path)?;
        Ok(Box::new(std::io::Cursor::new(data.to_vec())))
    }

    fn clone_transport(&self) -> Box<dyn Transport> {
        Box::new(Self {
            op: self.op.clone(),
            kind: self.kind,
            mode: self.mode,
        })
    }
}
