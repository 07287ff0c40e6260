//! Job execution pipeline: init → dump targets → fan out to storages →
//! rotate → cleanup → close.
//!
//! Targets run sequentially (dump tools are heavy clients of the source);
//! delivery fans out with one thread per storage. The trailing delivery
//! pass is an idempotent safety net: pairs already delivered are skipped,
//! so it both implements deferred copying and retries first-pass failures.

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::adapters::{self, DumpContext};
use crate::error::{FerryError, MultiError, Result};
use crate::exec::{self, CancelToken};
use crate::job::Job;
use crate::metrics::Metrics;

pub struct Runner<'a> {
    metrics: &'a Metrics,
    cancel: &'a CancelToken,
    probed: HashSet<&'static str>,
}

/// Per-job result: `Err` aborts the whole run (config/prereq trouble),
/// `Ok(Some(_))` is a job that ran and accumulated failures.
pub type JobResult = Result<Option<MultiError>>;

impl<'a> Runner<'a> {
    pub fn new(metrics: &'a Metrics, cancel: &'a CancelToken) -> Self {
        Self {
            metrics,
            cancel,
            probed: HashSet::new(),
        }
    }

    /// Probe each required binary once per run.
    fn check_prereqs(&mut self, job: &Job) -> Result<()> {
        for bin in adapters::required_binaries(job.kind) {
            if self.probed.contains(bin) {
                continue;
            }
            exec::probe_binary(bin).map_err(|_| {
                FerryError::PrereqMissing(format!("job '{}' needs '{bin}'", job.name))
            })?;
            self.probed.insert(bin);
        }
        Ok(())
    }

    /// Probe binaries (fatal when missing) and source connectivity
    /// (recorded, never fatal: the per-target dump is the authority).
    fn init(&mut self, job: &Job, errs: &mut MultiError) -> Result<()> {
        self.check_prereqs(job)?;
        for (ofs, target) in &job.targets {
            if let Some(e) = adapters::validate_source(target) {
                warn!(job = %job.name, ofs, "{e}");
                errs.push(e);
            }
            self.metrics.register_target(&job.name, ofs);
        }
        Ok(())
    }

    pub fn run_job(&mut self, job: &mut Job) -> JobResult {
        if !job.enabled {
            info!(job = %job.name, "job disabled, skipping");
            return Ok(None);
        }
        self.cancel.check()?;

        let mut errs = MultiError::new();
        self.init(job, &mut errs)?;

        // Execute: one target at a time.
        let ofs_list = job.ofs_list();
        for ofs in &ofs_list {
            if self.cancel.is_cancelled() {
                errs.push(FerryError::Cancelled);
                break;
            }
            let target = job.targets.get(ofs).cloned().expect("target exists");
            let started = Instant::now();
            let now = Utc::now();
            self.metrics
                .start_backup(&job.name, ofs, now.timestamp());

            let ctx = DumpContext {
                job_name: &job.name,
                kind: job.kind,
                tmp_dir: &job.tmp_dir,
                rate_limit: job.disk_rate_limit,
                now,
            };
            match adapters::dump(&ctx, ofs, &target, self.cancel) {
                Ok(dump) => {
                    let size = std::fs::metadata(&dump.tmp_file).map(|m| m.len()).unwrap_or(0);
                    self.metrics.backup_done(
                        &job.name,
                        ofs,
                        true,
                        started.elapsed().as_millis() as u64,
                        size,
                    );
                    debug!(job = %job.name, ofs, tmp = %dump.tmp_file.display(), "temp backup created");
                    job.dumped.insert(ofs.clone(), dump);
                }
                Err(e) => {
                    self.metrics.backup_done(
                        &job.name,
                        ofs,
                        false,
                        started.elapsed().as_millis() as u64,
                        0,
                    );
                    warn!(job = %job.name, ofs, "dump failed: {e}");
                    errs.push(e);
                    continue;
                }
            }

            if !job.deferred_copying {
                self.deliver_all(job, &mut errs);
            }
        }

        // Safety net: idempotent flush for deferred and previously failed
        // deliveries.
        self.deliver_all(job, &mut errs);

        // One retry pass for pairs that failed the flush; the idempotent
        // skip keeps already-delivered pairs untouched.
        let storage_count = job.storages.len();
        if !self.cancel.is_cancelled()
            && job
                .dumped
                .values()
                .any(|d| !d.delivered_everywhere(storage_count))
        {
            info!(job = %job.name, "retrying undelivered targets");
            self.deliver_all(job, &mut errs);
        }

        self.rotate(job, &mut errs);
        self.cleanup(job, &mut errs);

        for storage in &job.storages {
            if let Err(e) = storage.close() {
                warn!(job = %job.name, storage = %storage.name(), "close failed: {e}");
            }
        }

        if errs.is_empty() {
            Ok(None)
        } else {
            Ok(Some(errs))
        }
    }

    /// Deliver every undelivered (target, storage) pair, one thread per
    /// storage, then record flags and metrics from the joined results.
    fn deliver_all(&self, job: &mut Job, errs: &mut MultiError) {
        let run_now = Utc::now();
        let pending: Vec<(String, crate::job::DumpObject)> = job
            .dumped
            .iter()
            .map(|(ofs, dump)| (ofs.clone(), dump.clone()))
            .collect();
        if pending.is_empty() {
            return;
        }

        type Delivered = Vec<(String, String, Result<()>, u64)>;
        let mut results: Delivered = Vec::new();

        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for storage in &job.storages {
                let handle = storage.clone_handle();
                let pending = &pending;
                let kind = job.kind;
                handles.push(scope.spawn(move || -> Delivered {
                    let mut out = Delivered::new();
                    for (ofs, dump) in pending {
                        if dump.delivered_on(handle.name()) {
                            continue;
                        }
                        let started = Instant::now();
                        let res = handle.deliver(dump, ofs, kind, run_now);
                        out.push((
                            ofs.clone(),
                            handle.name().to_string(),
                            res,
                            started.elapsed().as_millis() as u64,
                        ));
                    }
                    out
                }));
            }
            for handle in handles {
                if let Ok(batch) = handle.join() {
                    results.extend(batch);
                }
            }
        });

        let storage_count = job.storages.len();
        // Fan-out wall time per target: the slowest storage in this pass.
        let mut elapsed_by_ofs: std::collections::HashMap<String, u64> =
            std::collections::HashMap::new();
        for (ofs, storage, res, elapsed_ms) in results {
            let slot = elapsed_by_ofs.entry(ofs.clone()).or_default();
            *slot = (*slot).max(elapsed_ms);
            match res {
                Ok(()) => {
                    if let Some(dump) = job.dumped.get_mut(&ofs) {
                        dump.mark_delivered(&storage);
                    }
                }
                Err(e) => {
                    warn!(job = %job.name, ofs, storage, "delivery failed: {e}");
                    errs.push(e);
                }
            }
        }

        for (ofs, elapsed_ms) in elapsed_by_ofs {
            let delivered = job
                .dumped
                .get(&ofs)
                .map(|d| d.delivered_everywhere(storage_count))
                .unwrap_or(false);
            self.metrics
                .delivery_done(&job.name, &ofs, delivered, elapsed_ms);
        }
    }

    /// Rotation starts only after deliveries settled on every storage.
    fn rotate(&self, job: &Job, errs: &mut MultiError) {
        if self.cancel.is_cancelled() {
            return;
        }
        let now = Utc::now();
        let kind = job.kind;
        let safety = job.safety_backup;
        // (OFS, full) pairs; a year-base dump requests the full incremental
        // purge of stale years.
        let plan: Vec<(String, bool)> = job
            .targets
            .keys()
            .map(|ofs| {
                let full = job.dumped.get(ofs).map(|d| d.year_base).unwrap_or(false);
                (ofs.clone(), full)
            })
            .collect();

        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for storage in &job.storages {
                let handle = storage.clone_handle();
                let plan = &plan;
                handles.push(scope.spawn(move || -> Vec<FerryError> {
                    let mut failures = Vec::new();
                    for (ofs, full) in plan {
                        if let Err(e) = handle.delete_old_backups(kind, ofs, safety, *full, now) {
                            failures.push(e);
                        }
                    }
                    failures
                }));
            }
            for handle in handles {
                if let Ok(failures) = handle.join() {
                    for e in failures {
                        warn!(job = %job.name, "rotation failed: {e}");
                        errs.push(e);
                    }
                }
            }
        });
    }

    /// Remove temp artifacts whose dump is delivered on every storage;
    /// partially delivered ones stay for the next run's retry pass.
    fn cleanup(&self, job: &mut Job, errs: &mut MultiError) {
        let storage_count = job.storages.len();
        let mut done: Vec<String> = Vec::new();

        for (ofs, dump) in &job.dumped {
            if !dump.delivered_everywhere(storage_count) {
                warn!(
                    job = %job.name,
                    ofs,
                    delivered = dump.delivered_count(),
                    storages = storage_count,
                    "keeping temp artifact of partially delivered target"
                );
                continue;
            }
            let mut removed = Ok(());
            removed = removed.and(std::fs::remove_file(&dump.tmp_file));
            if let Some(meta) = &dump.metadata_file {
                removed = removed.and(std::fs::remove_file(meta));
            }
            match removed {
                Ok(()) => {
                    debug!(job = %job.name, ofs, "temp artifact removed");
                    done.push(ofs.clone());
                }
                Err(e) => errs.push(FerryError::CleanupFailed(format!(
                    "{}: {e}",
                    dump.tmp_file.display()
                ))),
            }
        }

        for ofs in done {
            job.dumped.remove(&ofs);
        }
    }
}
