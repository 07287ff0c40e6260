//! Archive packer: drives `tar` with its stream wired through the disk
//! rate limiter.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::error::{FerryError, Result};
use crate::exec::{self, CancelToken};
use crate::limits::{LimitedReader, RateLimiter};

#[derive(Debug)]
pub struct TarOpts<'a> {
    pub src: &'a Path,
    pub dst: &'a Path,
    pub gzip: bool,
    /// Store members under their absolute path instead of relative to the
    /// source's parent directory.
    pub save_abs_path: bool,
    pub excludes: &'a [String],
    /// `--listed-incremental` metadata, updated in place and copied next to
    /// the output as `<dst>.inc`.
    pub snar: Option<&'a Path>,
    pub rate_limit: u64,
}

/// Path of the metadata sidecar shipped with an incremental artifact.
pub fn sidecar_path(dst: &Path) -> PathBuf {
    let mut os = dst.as_os_str().to_owned();
    os.push(".inc");
    PathBuf::from(os)
}

/// Build `<dst>` from `<src>` via `tar --create`, throttled to
/// `rate_limit` bytes/s on the archive stream.
pub fn pack(opts: &TarOpts<'_>, cancel: &CancelToken) -> Result<()> {
    cancel.check()?;

    let mut cmd = Command::new("tar");
    cmd.arg("--create").arg("--file").arg("-");
    if opts.gzip {
        cmd.arg("--gzip");
    }
    for pattern in opts.excludes {
        cmd.arg(format!("--exclude={pattern}"));
    }
    if let Some(snar) = opts.snar {
        cmd.arg(format!("--listed-incremental={}", snar.display()));
    }
    if opts.save_abs_path {
        cmd.arg("--absolute-names").arg(opts.src);
    } else {
        let parent = opts.src.parent().unwrap_or_else(|| Path::new("/"));
        let name = opts
            .src
            .file_name()
            .ok_or_else(|| FerryError::Config(format!("bad tar source: {:?}", opts.src)))?;
        cmd.arg("-C").arg(parent).arg(name);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!(?cmd, "tar command");

    let mut child = cmd.spawn()?;
    let stderr_handle = exec::capture_stderr(&mut child);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| FerryError::Io(std::io::Error::other("tar stdout not captured")))?;
    let mut reader = LimitedReader::new(stdout, RateLimiter::shared(opts.rate_limit));

    let copy_result = (|| -> Result<u64> {
        let mut out = File::create(opts.dst)?;
        let mut buf = [0u8; 128 * 1024];
        let mut written = 0u64;
        loop {
            cancel.check()?;
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            written += n as u64;
        }
        out.flush()?;
        Ok(written)
    })();
    drop(reader);

    let waited = exec::wait_cancellable(&mut child, cancel);
    let stderr = stderr_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    let outcome = (|| -> Result<u64> {
        let written = copy_result?;
        let status = waited?;
        if !status.success() {
            return Err(FerryError::PackFailed {
                code: status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(written)
    })();

    match outcome {
        Ok(written) => {
            info!(dst = %opts.dst.display(), bytes = written, "archive created");
            if let Some(snar) = opts.snar {
                std::fs::copy(snar, sidecar_path(opts.dst))?;
            }
            Ok(())
        }
        Err(err) => {
            let _ = std::fs::remove_file(opts.dst);
            if opts.snar.is_some() {
                let _ = std::fs::remove_file(sidecar_path(opts.dst));
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn source_tree(dir: &Path) -> PathBuf {
        let src = dir.join("data");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), b"alpha").unwrap();
        fs::write(src.join("sub/b.txt"), b"bravo").unwrap();
        fs::write(src.join("skip.log"), b"noise").unwrap();
        src
    }

    #[test]
    fn packs_directory_to_tar() {
        let dir = tempfile::tempdir().unwrap();
        let src = source_tree(dir.path());
        let dst = dir.path().join("out.tar");
        pack(
            &TarOpts {
                src: &src,
                dst: &dst,
                gzip: false,
                save_abs_path: false,
                excludes: &[],
                snar: None,
                rate_limit: 0,
            },
            &CancelToken::new(),
        )
        .unwrap();

        let listing = std::process::Command::new("tar")
            .arg("-tf")
            .arg(&dst)
            .output()
            .unwrap();
        let listing = String::from_utf8_lossy(&listing.stdout).to_string();
        assert!(listing.contains("data/a.txt"));
        assert!(listing.contains("data/sub/b.txt"));
    }

    #[test]
    fn gzip_output_is_gzip_magic() {
        let dir = tempfile::tempdir().unwrap();
        let src = source_tree(dir.path());
        let dst = dir.path().join("out.tar.gz");
        pack(
            &TarOpts {
                src: &src,
                dst: &dst,
                gzip: true,
                save_abs_path: false,
                excludes: &[],
                snar: None,
                rate_limit: 0,
            },
            &CancelToken::new(),
        )
        .unwrap();
        let bytes = fs::read(&dst).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn excludes_are_honored() {
        let dir = tempfile::tempdir().unwrap();
        let src = source_tree(dir.path());
        let dst = dir.path().join("out.tar");
        pack(
            &TarOpts {
                src: &src,
                dst: &dst,
                gzip: false,
                save_abs_path: false,
                excludes: &["*.log".into()],
                snar: None,
                rate_limit: 0,
            },
            &CancelToken::new(),
        )
        .unwrap();
        let listing = std::process::Command::new("tar")
            .arg("-tf")
            .arg(&dst)
            .output()
            .unwrap();
        let listing = String::from_utf8_lossy(&listing.stdout).to_string();
        assert!(!listing.contains("skip.log"));
    }

    #[test]
    fn missing_source_is_pack_failed_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out.tar");
        let err = pack(
            &TarOpts {
                src: &dir.path().join("absent"),
                dst: &dst,
                gzip: false,
                save_abs_path: false,
                excludes: &[],
                snar: None,
                rate_limit: 0,
            },
            &CancelToken::new(),
        )
        .unwrap_err();
        match err {
            FerryError::PackFailed { code, stderr } => {
                assert_ne!(code, 0);
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dst.exists(), "partial output should be removed");
    }

    #[test]
    fn incremental_snar_updates_and_ships_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let src = source_tree(dir.path());
        let snar = dir.path().join("state.snar");

        let full = dir.path().join("level0.tar");
        pack(
            &TarOpts {
                src: &src,
                dst: &full,
                gzip: false,
                save_abs_path: false,
                excludes: &[],
                snar: Some(&snar),
                rate_limit: 0,
            },
            &CancelToken::new(),
        )
        .unwrap();
        assert!(snar.exists());
        assert!(sidecar_path(&full).exists());

        fs::write(src.join("c.txt"), b"charlie").unwrap();
        let delta = dir.path().join("level1.tar");
        pack(
            &TarOpts {
                src: &src,
                dst: &delta,
                gzip: false,
                save_abs_path: false,
                excludes: &[],
                snar: Some(&snar),
                rate_limit: 0,
            },
            &CancelToken::new(),
        )
        .unwrap();
        assert!(sidecar_path(&delta).exists());
        // The delta must be smaller than the level-0 archive.
        let full_len = fs::metadata(&full).unwrap().len();
        let delta_len = fs::metadata(&delta).unwrap().len();
        assert!(delta_len <= full_len);
    }
}
