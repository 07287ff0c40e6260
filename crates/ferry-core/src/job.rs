//! Job, target and dump-object data model.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    DescFiles,
    IncFiles,
    Mysql,
    MysqlXtrabackup,
    Postgresql,
    PostgresqlBasebackup,
    Mongodb,
    Redis,
    External,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::DescFiles => "desc_files",
            JobType::IncFiles => "inc_files",
            JobType::Mysql => "mysql",
            JobType::MysqlXtrabackup => "mysql_xtrabackup",
            JobType::Postgresql => "postgresql",
            JobType::PostgresqlBasebackup => "postgresql_basebackup",
            JobType::Mongodb => "mongodb",
            JobType::Redis => "redis",
            JobType::External => "external",
        }
    }

    /// Incremental jobs use the year/month/day layout and `.inc` sidecars.
    pub fn is_incremental(self) -> bool {
        matches!(self, JobType::IncFiles)
    }

    /// Extension of the temp artifact before an optional `.gz`.
    pub fn artifact_ext(self) -> &'static str {
        match self {
            JobType::Mysql | JobType::Postgresql => "sql",
            JobType::Redis => "rdb",
            _ => "tar",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters shared by the database adapters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbConnect {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Unix socket path, preferred over host/port when set (MySQL, Redis).
    #[serde(default)]
    pub socket: Option<String>,
    /// Authentication database (MongoDB).
    #[serde(default)]
    pub auth_db: Option<String>,
    /// CA bundle for TLS-verified connections.
    #[serde(default)]
    pub tls_ca_file: Option<String>,
}

/// Per-adapter ingest parameters for one target.
#[derive(Debug, Clone)]
pub enum TargetParams {
    Files {
        path: PathBuf,
        excludes: Vec<String>,
        save_abs_path: bool,
    },
    Mysql {
        conn: DbConnect,
        db: String,
        ignore_tables: Vec<String>,
        extra_args: Vec<String>,
    },
    MysqlXtrabackup {
        conn: DbConnect,
        extra_args: Vec<String>,
    },
    Postgresql {
        conn: DbConnect,
        db: String,
        exclude_tables: Vec<String>,
        extra_args: Vec<String>,
    },
    PostgresqlBasebackup {
        conn: DbConnect,
        extra_args: Vec<String>,
    },
    Mongodb {
        conn: DbConnect,
        db: String,
        collections: Vec<String>,
        extra_args: Vec<String>,
    },
    Redis {
        conn: DbConnect,
        extra_args: Vec<String>,
    },
    External {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
}

/// One logical source inside a job, keyed by its OFS.
#[derive(Debug, Clone)]
pub struct Target {
    pub source_name: String,
    pub gzip: bool,
    pub params: TargetParams,
}

/// Mutable record for a target's current run.
#[derive(Debug, Clone, Default)]
pub struct DumpObject {
    pub tmp_file: PathBuf,
    /// `.inc` sidecar for incremental artifacts; the pair is atomic.
    pub metadata_file: Option<PathBuf>,
    /// Level-0 of a new year: triggers the full incremental rotation.
    pub year_base: bool,
    delivered_to: BTreeSet<String>,
}

impl DumpObject {
    pub fn new(tmp_file: PathBuf) -> Self {
        Self {
            tmp_file,
            ..Default::default()
        }
    }

    pub fn delivered_on(&self, storage: &str) -> bool {
        self.delivered_to.contains(storage)
    }

    pub fn mark_delivered(&mut self, storage: &str) {
        self.delivered_to.insert(storage.to_string());
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered_to.len()
    }

    /// Frozen once every storage holds a copy.
    pub fn delivered_everywhere(&self, storage_count: usize) -> bool {
        self.delivered_to.len() == storage_count
    }
}

/// A named unit of work: one backup type, its targets, and the storages
/// every artifact fans out to.
pub struct Job {
    pub name: String,
    pub kind: JobType,
    pub tmp_dir: PathBuf,
    /// `need_to_make_backup`: disabled jobs are skipped entirely.
    pub enabled: bool,
    pub safety_backup: bool,
    pub deferred_copying: bool,
    pub disk_rate_limit: u64,
    pub storages: Vec<Storage>,
    pub targets: BTreeMap<String, Target>,
    pub dumped: BTreeMap<String, DumpObject>,
}

impl Job {
    pub fn ofs_list(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }
}
