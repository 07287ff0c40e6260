//! MySQL adapters: logical dumps via `mysqldump` and physical snapshots
//! via `xtrabackup`.

use std::fs::{self, File};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::adapters::{dump_failed, gzip_file, DumpContext};
use crate::error::Result;
use crate::exec::{self, CancelToken};
use crate::job::{DbConnect, DumpObject};
use crate::naming;
use crate::tar_pack::{self, TarOpts};

fn conn_args(cmd: &mut Command, conn: &DbConnect) {
    if let Some(socket) = &conn.socket {
        cmd.arg(format!("--socket={socket}"));
    } else {
        cmd.arg(format!("--host={}", conn.host));
        if let Some(port) = conn.port {
            cmd.arg(format!("--port={port}"));
        }
    }
    cmd.arg(format!("--user={}", conn.user));
    // The password travels via the environment, not argv.
    cmd.env("MYSQL_PWD", &conn.password);
}

#[allow(clippy::too_many_arguments)]
pub fn dump(
    ctx: &DumpContext<'_>,
    ofs: &str,
    conn: &DbConnect,
    db: &str,
    ignore_tables: &[String],
    extra_args: &[String],
    gzip: bool,
    cancel: &CancelToken,
) -> Result<DumpObject> {
    let artifact = naming::tmp_artifact_path(ctx.tmp_dir, ofs, ctx.kind.artifact_ext(), gzip, ctx.now);
    if let Some(parent) = artifact.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = if gzip {
        artifact.with_extension("") // strip the trailing .gz while dumping
    } else {
        artifact.clone()
    };

    let mut cmd = Command::new("mysqldump");
    conn_args(&mut cmd, conn);
    cmd.arg("--single-transaction");
    for table in ignore_tables {
        cmd.arg(format!("--ignore-table={db}.{table}"));
    }
    cmd.args(extra_args);
    cmd.arg(db);
    cmd.stdout(Stdio::from(File::create(&raw)?));
    debug!(job = ctx.job_name, ofs, "mysqldump starting");

    let out = exec::run_cmd(&mut cmd, cancel).inspect_err(|_| {
        let _ = fs::remove_file(&raw);
    })?;
    if !out.success() {
        let _ = fs::remove_file(&raw);
        return Err(dump_failed(
            ofs,
            format!("mysqldump exited {}: {}", out.code(), out.stderr),
        ));
    }

    if gzip {
        gzip_file(&raw, cancel)?;
    }
    info!(job = ctx.job_name, ofs, "mysql dump completed");
    Ok(DumpObject::new(artifact))
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
    let snapshot_dir = artifact.with_file_name(format!("xtrabackup_{}", naming::timestamp(ctx.now)));

    let mut cmd = Command::new("xtrabackup");
    cmd.arg("--backup")
        .arg(format!("--target-dir={}", snapshot_dir.display()));
    conn_args(&mut cmd, conn);
    cmd.args(extra_args);
    debug!(job = ctx.job_name, ofs, "xtrabackup starting");

    let result = (|| -> Result<()> {
        let out = exec::run_cmd(&mut cmd, cancel)?;
        if !out.success() {
            return Err(dump_failed(
                ofs,
                format!("xtrabackup exited {}: {}", out.code(), out.stderr),
            ));
        }
        tar_pack::pack(
            &TarOpts {
                src: &snapshot_dir,
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
    let _ = fs::remove_dir_all(&snapshot_dir);
    result?;

    info!(job = ctx.job_name, ofs, "xtrabackup snapshot packed");
    Ok(DumpObject::new(artifact))
}
