//! External adapter: a user-supplied command produces the artifact at the
//! path handed to it via the environment.

use std::collections::BTreeMap;
use std::fs;
use std::process::Command;

use tracing::{debug, info};

use crate::adapters::{dump_failed, DumpContext};
use crate::error::Result;
use crate::exec::{self, CancelToken};
use crate::job::DumpObject;
use crate::naming;

#[allow(clippy::too_many_arguments)]
pub fn dump(
    ctx: &DumpContext<'_>,
    ofs: &str,
    command: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    gzip: bool,
    cancel: &CancelToken,
) -> Result<DumpObject> {
    let artifact = naming::tmp_artifact_path(ctx.tmp_dir, ofs, ctx.kind.artifact_ext(), gzip, ctx.now);
    if let Some(parent) = artifact.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut cmd = Command::new(command);
    cmd.args(args)
        .envs(env)
        .env("FERRY_JOB", ctx.job_name)
        .env("FERRY_OFS", ofs)
        .env("FERRY_TMP_FILE", &artifact)
        .env("FERRY_GZIP", if gzip { "1" } else { "0" });
    debug!(job = ctx.job_name, ofs, command, "external dump starting");

    let out = exec::run_cmd(&mut cmd, cancel)?;
    if !out.success() {
        let _ = fs::remove_file(&artifact);
        return Err(dump_failed(
            ofs,
            format!("'{command}' exited {}: {}", out.code(), out.stderr),
        ));
    }
    if !artifact.is_file() {
        return Err(dump_failed(
            ofs,
            format!("'{command}' succeeded but produced no artifact at FERRY_TMP_FILE"),
        ));
    }

    info!(job = ctx.job_name, ofs, "external dump completed");
    Ok(DumpObject::new(artifact))
}
