//! PostgreSQL adapters: logical dumps via `pg_dump` and physical base
//! backups via `pg_basebackup`.

use std::fs;
use std::process::Command;

use tracing::{debug, info};

use crate::adapters::{dump_failed, gzip_file, DumpContext};
use crate::error::Result;
use crate::exec::{self, CancelToken};
use crate::job::{DbConnect, DumpObject};
use crate::naming;
use crate::tar_pack::{self, TarOpts};

/// `pg_basebackup --max-rate` accepts 32 kB/s .. 1024 MB/s.
const PG_MAX_RATE_MIN_KB: u64 = 32;
const PG_MAX_RATE_MAX_KB: u64 = 1024 * 1024;

fn conn_args(cmd: &mut Command, conn: &DbConnect) {
    cmd.arg("--host").arg(&conn.host);
    if let Some(port) = conn.port {
        cmd.arg("--port").arg(port.to_string());
    }
    cmd.arg("--username").arg(&conn.user);
    cmd.arg("--no-password");
    cmd.env("PGPASSWORD", &conn.password);
}

#[allow(clippy::too_many_arguments)]
pub fn dump(
    ctx: &DumpContext<'_>,
    ofs: &str,
    conn: &DbConnect,
    db: &str,
    exclude_tables: &[String],
    extra_args: &[String],
    gzip: bool,
    cancel: &CancelToken,
) -> Result<DumpObject> {
    let artifact = naming::tmp_artifact_path(ctx.tmp_dir, ofs, ctx.kind.artifact_ext(), gzip, ctx.now);
    if let Some(parent) = artifact.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = if gzip {
        artifact.with_extension("")
    } else {
        artifact.clone()
    };

    let mut cmd = Command::new("pg_dump");
    conn_args(&mut cmd, conn);
    cmd.arg("--dbname").arg(db);
    for table in exclude_tables {
        cmd.arg(format!("--exclude-table={table}"));
    }
    cmd.args(extra_args);
    cmd.arg("--file").arg(&raw);
    debug!(job = ctx.job_name, ofs, "pg_dump starting");

    let out = exec::run_cmd(&mut cmd, cancel).inspect_err(|_| {
        let _ = fs::remove_file(&raw);
    })?;
    if !out.success() {
        let _ = fs::remove_file(&raw);
        return Err(dump_failed(
            ofs,
            format!("pg_dump exited {}: {}", out.code(), out.stderr),
        ));
    }

    if gzip {
        gzip_file(&raw, cancel)?;
    }
    info!(job = ctx.job_name, ofs, "postgresql dump completed");
    Ok(DumpObject::new(artifact))
}

/// Clamp the job's byte rate into pg_basebackup's accepted kB/s window.
fn max_rate_kb(rate_limit: u64) -> Option<u64> {
    (rate_limit > 0).then(|| (rate_limit / 1024).clamp(PG_MAX_RATE_MIN_KB, PG_MAX_RATE_MAX_KB))
}

pub fn dump_physical(
    ctx: &DumpContext<'_>,
    ofs: &str,
    conn: &DbConnect,
    extra_args: &[String],
    gzip: bool,
    cancel: &CancelToken,
) -> Result<DumpObject> {
    let artifact = naming::tmp_artifact_path(ctx.tmp_dir, ofs, ctx.kind.artifact_ext(), gzip, ctx.now);
    if let Some(parent) = artifact.parent() {
        fs::create_dir_all(parent)?;
    }
    let pgdata = artifact.with_file_name(format!("pg_basebackup_{}", naming::timestamp(ctx.now)));

    let mut cmd = Command::new("pg_basebackup");
    cmd.args(extra_args);
    conn_args(&mut cmd, conn);
    cmd.arg(format!("--pgdata={}", pgdata.display()))
        .arg("--format=plain");
    if let Some(kb) = max_rate_kb(ctx.rate_limit) {
        cmd.arg(format!("--max-rate={kb}"));
    }
    debug!(job = ctx.job_name, ofs, "pg_basebackup starting");

    let result = (|| -> Result<()> {
        let out = exec::run_cmd(&mut cmd, cancel)?;
        if !out.success() {
            return Err(dump_failed(
                ofs,
                format!("pg_basebackup exited {}: {}", out.code(), out.stderr),
            ));
        }
        tar_pack::pack(
            &TarOpts {
                src: &pgdata,
                dst: &artifact,
                gzip,
                save_abs_path: false,
                excludes: &[],
                snar: None,
                rate_limit: ctx.rate_limit,
            },
            cancel,
        )
        .map_err(|e| dump_failed(ofs, e))
    })();
    let _ = fs::remove_dir_all(&pgdata);
    result?;

    info!(job = ctx.job_name, ofs, "base backup packed");
    Ok(DumpObject::new(artifact))
}
