//! File-tree targets: full archives and `--listed-incremental` deltas.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::adapters::{dump_failed, DumpContext};
use crate::error::Result;
use crate::exec::CancelToken;
use crate::job::{DumpObject, JobType};
use crate::naming;
use crate::tar_pack::{self, TarOpts};

/// Persistent snar location for one OFS and year. It outlives cleanup so
/// deltas keep building on the same baseline; a missing file for the
/// current year marks the run as the year's level-0.
fn snar_path(tmp_dir: &Path, ofs: &str, year: i32) -> std::path::PathBuf {
    tmp_dir.join(ofs).join(format!("inc_{year}.snar"))
}

#[allow(clippy::too_many_arguments)]
pub fn dump(
    ctx: &DumpContext<'_>,
    ofs: &str,
    src: &Path,
    excludes: &[String],
    save_abs_path: bool,
    gzip: bool,
    cancel: &CancelToken,
) -> Result<DumpObject> {
    let artifact = naming::tmp_artifact_path(ctx.tmp_dir, ofs, ctx.kind.artifact_ext(), gzip, ctx.now);
    if let Some(parent) = artifact.parent() {
        fs::create_dir_all(parent)?;
    }

    let incremental = ctx.kind == JobType::IncFiles;
    let snar =
        incremental.then(|| snar_path(ctx.tmp_dir, ofs, chrono::Datelike::year(&ctx.now)));

    let mut year_base = false;
    if let Some(snar) = &snar {
        year_base = !snar.exists();
        if year_base {
            // Stale baselines from previous years are no longer useful.
            if let Some(dir) = snar.parent() {
                if let Ok(iter) = fs::read_dir(dir) {
                    for entry in iter.filter_map(|e| e.ok()) {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        if name.starts_with("inc_") && name.ends_with(".snar") {
                            let _ = fs::remove_file(entry.path());
                        }
                    }
                }
            }
            info!(job = ctx.job_name, ofs, "starting a new incremental year");
        }
    }

    debug!(job = ctx.job_name, ofs, src = %src.display(), "packing file tree");
    tar_pack::pack(
        &TarOpts {
            src,
            dst: &artifact,
            gzip,
            save_abs_path,
            excludes,
            snar: snar.as_deref(),
            rate_limit: ctx.rate_limit,
        },
        cancel,
    )
    .map_err(|e| dump_failed(ofs, e))?;

    let mut dump = DumpObject::new(artifact);
    if snar.is_some() {
        dump.metadata_file = Some(tar_pack::sidecar_path(&dump.tmp_file));
        dump.year_base = year_base;
    }
    Ok(dump)
}
