//! Process-wide metrics registry, rendered in Prometheus text format.
//!
//! One gauge family per measurement, labelled `(job, target)`; shells are
//! registered with zero values at job init so scrapes see every configured
//! target even before its first run.

use std::path::Path;

use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::error::{FerryError, Result};

const LABELS: &[&str] = &["job", "target"];

pub struct Metrics {
    registry: Registry,
    backup_ok: GaugeVec,
    backup_time_ms: GaugeVec,
    backup_size_bytes: GaugeVec,
    backup_timestamp: GaugeVec,
    delivery_ok: GaugeVec,
    delivery_time_ms: GaugeVec,
    up: Gauge,
    last_run_timestamp: Gauge,
}

fn gauge_vec(registry: &Registry, name: &str, help: &str) -> GaugeVec {
    let vec = GaugeVec::new(Opts::new(name, help), LABELS)
        .expect("static metric definition is valid");
    registry
        .register(Box::new(vec.clone()))
        .expect("metric registered once");
    vec
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let up = Gauge::new("ferry_up", "Whether the last run completed").unwrap();
        let last_run_timestamp = Gauge::new(
            "ferry_last_run_timestamp",
            "Unix time of the last completed run",
        )
        .unwrap();
        registry.register(Box::new(up.clone())).unwrap();
        registry
            .register(Box::new(last_run_timestamp.clone()))
            .unwrap();

        Self {
            backup_ok: gauge_vec(&registry, "backup_ok", "Backup creation succeeded"),
            backup_time_ms: gauge_vec(&registry, "backup_time_ms", "Backup creation wall time"),
            backup_size_bytes: gauge_vec(&registry, "backup_size_bytes", "Temp artifact size"),
            backup_timestamp: gauge_vec(
                &registry,
                "backup_timestamp",
                "Unix time the backup started",
            ),
            delivery_ok: gauge_vec(&registry, "delivery_ok", "Delivered to every storage"),
            delivery_time_ms: gauge_vec(&registry, "delivery_time_ms", "Total delivery wall time"),
            up,
            last_run_timestamp,
            registry,
        }
    }

    /// Zero-valued shells for one (job, target) pair.
    pub fn register_target(&self, job: &str, ofs: &str) {
        for vec in [
            &self.backup_ok,
            &self.backup_time_ms,
            &self.backup_size_bytes,
            &self.backup_timestamp,
            &self.delivery_ok,
            &self.delivery_time_ms,
        ] {
            vec.with_label_values(&[job, ofs]).set(0.0);
        }
    }

    pub fn start_backup(&self, job: &str, ofs: &str, timestamp: i64) {
        self.register_target(job, ofs);
        self.backup_timestamp
            .with_label_values(&[job, ofs])
            .set(timestamp as f64);
    }

    pub fn backup_done(&self, job: &str, ofs: &str, ok: bool, elapsed_ms: u64, size_bytes: u64) {
        self.backup_ok
            .with_label_values(&[job, ofs])
            .set(bool_gauge(ok));
        self.backup_time_ms
            .with_label_values(&[job, ofs])
            .set(elapsed_ms as f64);
        self.backup_size_bytes
            .with_label_values(&[job, ofs])
            .set(size_bytes as f64);
    }

    pub fn delivery_done(&self, job: &str, ofs: &str, ok: bool, elapsed_ms: u64) {
        self.delivery_ok
            .with_label_values(&[job, ofs])
            .set(bool_gauge(ok));
        self.delivery_time_ms
            .with_label_values(&[job, ofs])
            .set(elapsed_ms as f64);
    }

    pub fn run_finished(&self, ok: bool, timestamp: i64) {
        self.up.set(bool_gauge(ok));
        self.last_run_timestamp.set(timestamp as f64);
    }

    pub fn gather_value(&self, name: &str, job: &str, ofs: &str) -> Option<f64> {
        self.registry
            .gather()
            .iter()
            .find(|mf| mf.get_name() == name)?
            .get_metric()
            .iter()
            .find(|m| {
                let labels = m.get_label();
                labels.iter().any(|l| l.get_name() == "job" && l.get_value() == job)
                    && labels
                        .iter()
                        .any(|l| l.get_name() == "target" && l.get_value() == ofs)
            })
            .map(|m| m.get_gauge().get_value())
    }

    /// Render the whole registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| FerryError::Config(format!("metrics encoding: {e}")))?;
        String::from_utf8(buf).map_err(|e| FerryError::Config(format!("metrics encoding: {e}")))
    }

    /// Node-exporter textfile-collector style output. Failures only warn;
    /// metrics must never take a run down.
    pub fn write_textfile(&self, path: &Path) {
        let result = self.render().and_then(|text| {
            let tmp = path.with_extension("prom.tmp");
            std::fs::write(&tmp, text)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        });
        if let Err(e) = result {
            warn!(path = %path.display(), "failed to write metrics textfile: {e}");
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bool_gauge(ok: bool) -> f64 {
    if ok {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shells_are_zero_valued() {
        let m = Metrics::new();
        m.register_target("job1", "ofs1");
        assert_eq!(m.gather_value("backup_ok", "job1", "ofs1"), Some(0.0));
        assert_eq!(m.gather_value("delivery_ok", "job1", "ofs1"), Some(0.0));
        assert_eq!(m.gather_value("backup_ok", "job1", "other"), None);
    }

    #[test]
    fn backup_and_delivery_updates_land() {
        let m = Metrics::new();
        m.start_backup("j", "o", 1_700_000_000);
        m.backup_done("j", "o", true, 1234, 9999);
        m.delivery_done("j", "o", true, 777);
        assert_eq!(m.gather_value("backup_ok", "j", "o"), Some(1.0));
        assert_eq!(m.gather_value("backup_size_bytes", "j", "o"), Some(9999.0));
        assert_eq!(m.gather_value("delivery_time_ms", "j", "o"), Some(777.0));
    }

    #[test]
    fn render_is_text_format() {
        let m = Metrics::new();
        m.register_target("j", "o");
        m.run_finished(true, 1_700_000_000);
        let text = m.render().unwrap();
        assert!(text.contains("# TYPE backup_ok gauge"));
        assert!(text.contains("ferry_up 1"));
        assert!(text.contains("backup_ok{job=\"j\",target=\"o\"} 0"));
    }

    #[test]
    fn textfile_write_is_atomic_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.prom");
        let m = Metrics::new();
        m.write_textfile(&path);
        assert!(path.exists());
        assert!(!dir.path().join("ferry.prom.tmp").exists());
    }
}
