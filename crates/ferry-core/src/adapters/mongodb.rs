//! MongoDB adapter: `mongodump` into a dump directory, packed to tar.

use std::fs;
use std::process::Command;

use tracing::{debug, info};

use crate::adapters::{dump_failed, DumpContext};
use crate::error::Result;
use crate::exec::{self, CancelToken};
use crate::job::{DbConnect, DumpObject};
use crate::naming;
use crate::tar_pack::{self, TarOpts};

#[allow(clippy::too_many_arguments)]
pub fn dump(
    ctx: &DumpContext<'_>,
    ofs: &str,
    conn: &DbConnect,
    db: &str,
    collections: &[String],
    extra_args: &[String],
    gzip: bool,
    cancel: &CancelToken,
) -> Result<DumpObject> {
    let artifact = naming::tmp_artifact_path(ctx.tmp_dir, ofs, ctx.kind.artifact_ext(), gzip, ctx.now);
    if let Some(parent) = artifact.parent() {
        fs::create_dir_all(parent)?;
    }
    let dump_dir = artifact.with_file_name("dump");

    let host = match conn.port {
        Some(port) => format!("{}:{port}", conn.host),
        None => conn.host.clone(),
    };

    let base_args = {
        let mut args = vec![
            format!("--host={host}"),
            format!(
                "--authenticationDatabase={}",
                conn.auth_db.as_deref().unwrap_or("admin")
            ),
            format!("--username={}", conn.user),
            format!("--password={}", conn.password),
            format!("--db={db}"),
        ];
        if let Some(ca) = &conn.tls_ca_file {
            args.push("--ssl".into());
            args.push(format!("--sslCAFile={ca}"));
        }
        args.extend(extra_args.iter().cloned());
        args.push(format!("--out={}", dump_dir.display()));
        args
    };

    let result = (|| -> Result<()> {
        // One invocation per collection; an empty list dumps the whole db.
        let runs: Vec<Option<&String>> = if collections.is_empty() {
            vec![None]
        } else {
            collections.iter().map(Some).collect()
        };
        for collection in runs {
            let mut cmd = Command::new("mongodump");
            cmd.args(&base_args);
            if let Some(collection) = collection {
                cmd.arg(format!("--collection={collection}"));
            }
            debug!(job = ctx.job_name, ofs, ?collection, "mongodump starting");
            let out = exec::run_cmd(&mut cmd, cancel)?;
            if !out.success() {
                return Err(dump_failed(
                    ofs,
                    format!("mongodump exited {}: {}", out.code(), out.stderr),
                ));
            }
        }

        tar_pack::pack(
            &TarOpts {
                src: &dump_dir,
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
    let _ = fs::remove_dir_all(&dump_dir);
    result?;

    info!(job = ctx.job_name, ofs, db, "mongodb dump completed");
    Ok(DumpObject::new(artifact))
}
