use std::path::PathBuf;

use serde::Deserialize;

use crate::job::JobType;
use crate::retention::Retention;

fn default_true() -> bool {
    true
}

fn default_loglevel() -> String {
    "info".into()
}

fn default_server_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into())
}

fn default_sftp_port() -> u16 {
    22
}

fn default_ftp_port() -> u16 {
    21
}

fn default_s3_region() -> String {
    "us-east-1".into()
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    /// Optional log file; console-only when absent.
    #[serde(default)]
    pub logfile: Option<PathBuf>,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage_connects: Vec<StorageConnect>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    /// Glob patterns of extra job documents merged into `jobs`.
    #[serde(default)]
    pub include_jobs: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub webhooks: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Textfile-collector output path.
    #[serde(default)]
    pub textfile_path: Option<PathBuf>,
}

/// A named destination endpoint jobs can reference.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConnect {
    pub name: String,
    #[serde(flatten)]
    pub params: TransportConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    S3 {
        bucket: String,
        #[serde(default = "default_s3_region")]
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        access_key_id: String,
        secret_access_key: String,
    },
    Sftp {
        host: String,
        #[serde(default = "default_sftp_port")]
        port: u16,
        user: String,
        #[serde(default)]
        key_file: Option<String>,
    },
    Ftp {
        host: String,
        #[serde(default = "default_ftp_port")]
        port: u16,
        user: String,
        #[serde(default)]
        password: String,
    },
    Webdav {
        endpoint: String,
        user: String,
        #[serde(default)]
        password: String,
    },
    /// Kernel-mounted share; primitives run over the filesystem.
    Smb { mount_path: PathBuf },
    /// Kernel-mounted share; primitives run over the filesystem.
    Nfs { mount_path: PathBuf },
}

/// One job entry as written in the config.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub job_name: String,
    #[serde(rename = "type")]
    pub kind: JobType,
    pub tmp_dir: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub safety_backup: bool,
    #[serde(default)]
    pub deferred_copying: bool,
    /// Human rate string, e.g. "10M"; absent or "0" disables throttling.
    #[serde(default)]
    pub disk_rate_limit: Option<String>,
    pub storages_options: Vec<JobStorageSpec>,
    /// Adapter-specific schemas, resolved against the job `type`.
    pub sources: Vec<serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobStorageSpec {
    /// `local` or a name from `storage_connects`.
    pub storage_name: String,
    pub backup_path: String,
    #[serde(default)]
    pub rate_limit: Option<String>,
    #[serde(default = "default_true")]
    pub enable_rotate: bool,
    #[serde(default)]
    pub retention: Retention,
}
