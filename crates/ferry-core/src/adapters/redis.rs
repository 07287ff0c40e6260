//! Redis adapter: RDB snapshot via `redis-cli --rdb`.

use std::fs;
use std::process::Command;

use tracing::{debug, info};

use crate::adapters::{dump_failed, gzip_file, DumpContext};
use crate::error::Result;
use crate::exec::{self, CancelToken};
use crate::job::{DbConnect, DumpObject};
use crate::naming;

pub fn dump(
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
    let raw = if gzip {
        artifact.with_extension("")
    } else {
        artifact.clone()
    };

    let mut cmd = Command::new("redis-cli");
    if let Some(socket) = &conn.socket {
        cmd.arg("-s").arg(socket);
    } else {
        cmd.arg("-h").arg(&conn.host);
        if let Some(port) = conn.port {
            cmd.arg("-p").arg(port.to_string());
        }
    }
    if !conn.password.is_empty() {
        cmd.env("REDISCLI_AUTH", &conn.password);
    }
    cmd.args(extra_args);
    cmd.arg("--rdb").arg(&raw);
    debug!(job = ctx.job_name, ofs, "redis rdb snapshot starting");

    let out = exec::run_cmd(&mut cmd, cancel).inspect_err(|_| {
        let _ = fs::remove_file(&raw);
    })?;
    if !out.success() {
        let _ = fs::remove_file(&raw);
        return Err(dump_failed(
            ofs,
            format!("redis-cli exited {}: {}", out.code(), out.stderr),
        ));
    }

    if gzip {
        gzip_file(&raw, cancel)?;
    }
    info!(job = ctx.job_name, ofs, "redis snapshot completed");
    Ok(DumpObject::new(artifact))
}
