//! Run-report notification interface. Channels are external collaborators;
//! this module defines the contract plus the two built-in sinks.

use serde::Serialize;
use tracing::{error, info, warn};

/// Per-job outcome handed to every notifier after a run.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub server_name: String,
    pub project_name: String,
    pub job: String,
    pub ok: bool,
    /// One-line summary.
    pub summary: String,
    /// Detailed body, one entry per failure.
    pub details: Vec<String>,
}

impl JobReport {
    pub fn success(server: &str, project: &str, job: &str) -> Self {
        Self {
            server_name: server.to_string(),
            project_name: project.to_string(),
            job: job.to_string(),
            ok: true,
            summary: format!("job '{job}' finished"),
            details: Vec::new(),
        }
    }

    pub fn failure(server: &str, project: &str, job: &str, details: Vec<String>) -> Self {
        Self {
            server_name: server.to_string(),
            project_name: project.to_string(),
            job: job.to_string(),
            ok: false,
            summary: format!("job '{job}' finished with {} error(s)", details.len()),
            details,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, report: &JobReport);
}

/// Default sink: the structured log stream.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, report: &JobReport) {
        if report.ok {
            info!(job = %report.job, "{}", report.summary);
        } else {
            error!(job = %report.job, "{}", report.summary);
            for line in &report.details {
                error!(job = %report.job, "  {line}");
            }
        }
    }
}

/// POSTs each report as JSON to the configured endpoints. Notification
/// failures are logged and never fail the run.
pub struct WebhookNotifier {
    endpoints: Vec<String>,
    client: reqwest::blocking::Client,
}

impl WebhookNotifier {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            client: reqwest::blocking::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, report: &JobReport) {
        for url in &self.endpoints {
            match self.client.post(url).json(report).send() {
                Ok(resp) if resp.status().is_success() => {
                    info!(url, job = %report.job, "notification delivered");
                }
                Ok(resp) => warn!(url, status = %resp.status(), "notification rejected"),
                Err(e) => warn!(url, "notification failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_report_counts_details() {
        let r = JobReport::failure("srv", "proj", "db", vec!["a".into(), "b".into()]);
        assert!(!r.ok);
        assert!(r.summary.contains("2 error(s)"));
    }

    #[test]
    fn report_serializes_to_json() {
        let r = JobReport::success("srv", "proj", "www");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["job"], "www");
        assert_eq!(json["ok"], true);
    }
}
