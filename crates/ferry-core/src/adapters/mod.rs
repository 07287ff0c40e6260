//! Source adapters: one per backup type, each building the external dump
//! command line for a target and producing its temp artifact.

mod external;
mod files;
mod mongodb;
mod mysql;
mod postgres;
mod redis;

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{FerryError, Result};
use crate::exec::{self, CancelToken};
use crate::job::{DumpObject, JobType, Target, TargetParams};

/// Per-run inputs shared by every adapter invocation.
pub struct DumpContext<'a> {
    pub job_name: &'a str,
    pub kind: JobType,
    pub tmp_dir: &'a Path,
    pub rate_limit: u64,
    pub now: DateTime<Utc>,
}

/// Binaries a job type needs on PATH, probed once at init.
pub fn required_binaries(kind: JobType) -> &'static [&'static str] {
    match kind {
        JobType::DescFiles | JobType::IncFiles => &["tar"],
        JobType::Mysql => &["mysqldump", "gzip"],
        JobType::MysqlXtrabackup => &["xtrabackup", "tar"],
        JobType::Postgresql => &["pg_dump", "gzip"],
        JobType::PostgresqlBasebackup => &["pg_basebackup", "tar"],
        JobType::Mongodb => &["mongodump", "tar"],
        JobType::Redis => &["redis-cli", "gzip"],
        JobType::External => &[],
    }
}

/// Connectivity probe via the client tooling (all extraction shells out,
/// so there is no in-process driver to ask). A probe that runs and fails
/// returns `SourceConnect`; a missing probe binary only logs, since the
/// dump tool itself may still work.
pub fn validate_source(target: &Target) -> Option<FerryError> {
    let probe = match &target.params {
        TargetParams::Postgresql { conn, .. } | TargetParams::PostgresqlBasebackup { conn, .. } => {
            let mut cmd = Command::new("pg_isready");
            cmd.arg("-h").arg(&conn.host).arg("-U").arg(&conn.user);
            if let Some(port) = conn.port {
                cmd.arg("-p").arg(port.to_string());
            }
            Some(cmd)
        }
        TargetParams::Mysql { conn, .. } | TargetParams::MysqlXtrabackup { conn, .. } => {
            let mut cmd = Command::new("mysqladmin");
            cmd.arg("ping")
                .arg(format!("--host={}", conn.host))
                .arg(format!("--user={}", conn.user))
                .env("MYSQL_PWD", &conn.password);
            if let Some(port) = conn.port {
                cmd.arg(format!("--port={port}"));
            }
            Some(cmd)
        }
        TargetParams::Redis { conn, .. } => {
            let mut cmd = Command::new("redis-cli");
            if let Some(socket) = &conn.socket {
                cmd.arg("-s").arg(socket);
            } else {
                cmd.arg("-h").arg(&conn.host);
                if let Some(port) = conn.port {
                    cmd.arg("-p").arg(port.to_string());
                }
            }
            cmd.arg("ping");
            Some(cmd)
        }
        _ => None,
    };

    match probe {
        Some(mut cmd) => {
            cmd.stdout(std::process::Stdio::null());
            match exec::run_cmd(&mut cmd, &CancelToken::new()) {
                Ok(out) if out.success() => None,
                Ok(out) => Some(FerryError::SourceConnect {
                    source_name: target.source_name.clone(),
                    reason: out.stderr.trim().to_string(),
                }),
                Err(e) => {
                    warn!(source = %target.source_name, "connectivity probe unavailable: {e}");
                    None
                }
            }
        }
        None => None,
    }
}

/// Produce the temp artifact for one target.
pub fn dump(
    ctx: &DumpContext<'_>,
    ofs: &str,
    target: &Target,
    cancel: &CancelToken,
) -> Result<DumpObject> {
    match &target.params {
        TargetParams::Files {
            path,
            excludes,
            save_abs_path,
        } => files::dump(
            ctx,
            ofs,
            path,
            excludes,
            *save_abs_path,
            target.gzip,
            cancel,
        ),
        TargetParams::Mysql {
            conn,
            db,
            ignore_tables,
            extra_args,
        } => mysql::dump(ctx, ofs, conn, db, ignore_tables, extra_args, target.gzip, cancel),
        TargetParams::MysqlXtrabackup { conn, extra_args } => {
            mysql::dump_physical(ctx, ofs, conn, extra_args, target.gzip, cancel)
        }
        TargetParams::Postgresql {
            conn,
            db,
            exclude_tables,
            extra_args,
        } => postgres::dump(ctx, ofs, conn, db, exclude_tables, extra_args, target.gzip, cancel),
        TargetParams::PostgresqlBasebackup { conn, extra_args } => {
            postgres::dump_physical(ctx, ofs, conn, extra_args, target.gzip, cancel)
        }
        TargetParams::Mongodb {
            conn,
            db,
            collections,
            extra_args,
        } => mongodb::dump(ctx, ofs, conn, db, collections, extra_args, target.gzip, cancel),
        TargetParams::Redis { conn, extra_args } => {
            redis::dump(ctx, ofs, conn, extra_args, target.gzip, cancel)
        }
        TargetParams::External { command, args, env } => {
            external::dump(ctx, ofs, command, args, env, target.gzip, cancel)
        }
    }
}

pub(crate) fn dump_failed(target: &str, reason: impl std::fmt::Display) -> FerryError {
    FerryError::DumpFailed {
        target: target.to_string(),
        reason: reason.to_string(),
    }
}

/// Compress a raw dump in place with the external `gzip`, yielding
/// `<path>.gz`.
pub(crate) fn gzip_file(path: &Path, cancel: &CancelToken) -> Result<PathBuf> {
    let mut cmd = Command::new("gzip");
    cmd.arg("--force").arg(path);
    let out = exec::run_cmd(&mut cmd, cancel)?;
    if !out.success() {
        return Err(FerryError::DumpFailed {
            target: path.display().to_string(),
            reason: format!("gzip exited {}: {}", out.code(), out.stderr),
        });
    }
    let mut os = path.as_os_str().to_owned();
    os.push(".gz");
    Ok(PathBuf::from(os))
}
