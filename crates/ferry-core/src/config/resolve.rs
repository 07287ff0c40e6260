//! Config loading: env placeholder expansion, include merging, validation.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{FerryError, Result};

use super::types::{ConfigDocument, JobSpec};

/// Search order when no `--config` flag is given.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["./ferry.yaml", "/etc/ferry/ferry.yaml"];

pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(env_path) = std::env::var_os("FERRY_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

/// Expand `${VAR}` and `${VAR:-default}` placeholders in raw config text.
///
/// The text is processed line by line so error positions fall out of the
/// scan for free; a placeholder must open and close on the same line.
pub fn expand_env_placeholders(input: &str, path: &Path) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    for (idx, line) in input.split_inclusive('\n').enumerate() {
        expand_line(line, idx + 1, path, &mut out)?;
    }
    Ok(out)
}

fn expand_line(line: &str, line_no: usize, path: &Path, out: &mut String) -> Result<()> {
    let mut rest = line;
    let mut column = 1usize;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        column += rest[..open].chars().count();

        let body = &rest[open + 2..];
        let Some(close) = body.find('}') else {
            return Err(placeholder_error(
                path,
                line_no,
                column,
                "unterminated ${...} placeholder",
            ));
        };
        let token = &body[..close];
        match lookup(token) {
            Ok(value) => out.push_str(&value),
            Err(message) => return Err(placeholder_error(path, line_no, column, message)),
        }
        // Past "${", the token, and the closing brace.
        column += token.chars().count() + 3;
        rest = &body[close + 1..];
    }

    out.push_str(rest);
    Ok(())
}

/// Resolve one placeholder token against the environment. An empty value
/// counts as unset when a `:-` fallback is given.
fn lookup(token: &str) -> std::result::Result<String, String> {
    let (name, fallback) = match token.split_once(":-") {
        Some((name, fallback)) => (name, Some(fallback)),
        None => (token, None),
    };

    let well_formed = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric());
    if !well_formed {
        return Err(format!("invalid placeholder '${{{token}}}'"));
    }

    match std::env::var(name) {
        Ok(value) => {
            if value.is_empty() {
                if let Some(fallback) = fallback {
                    return Ok(fallback.to_string());
                }
            }
            Ok(value)
        }
        Err(std::env::VarError::NotPresent) => match fallback {
            Some(fallback) => Ok(fallback.to_string()),
            None => Err(format!("environment variable '{name}' is not set")),
        },
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(format!("environment variable '{name}' is not valid UTF-8"))
        }
    }
}

fn placeholder_error(
    path: &Path,
    line: usize,
    column: usize,
    message: impl fmt::Display,
) -> FerryError {
    FerryError::Config(format!("{}:{line}:{column}: {message}", path.display()))
}

fn parse_document(path: &Path) -> Result<ConfigDocument> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| FerryError::Config(format!("cannot read '{}': {e}", path.display())))?;
    let expanded = expand_env_placeholders(&contents, path)?;
    serde_yaml::from_str(&expanded)
        .map_err(|e| FerryError::Config(format!("invalid config '{}': {e}", path.display())))
}

fn parse_job_document(path: &Path) -> Result<Vec<JobSpec>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| FerryError::Config(format!("cannot read '{}': {e}", path.display())))?;
    let expanded = expand_env_placeholders(&contents, path)?;
    serde_yaml::from_str(&expanded)
        .map_err(|e| FerryError::Config(format!("invalid job file '{}': {e}", path.display())))
}

/// Load a config document, merge `include_jobs` globs, and validate the
/// cross-references a later build step relies on.
pub fn load(path: &Path) -> Result<ConfigDocument> {
    let mut doc = parse_document(path)?;

    for pattern in doc.include_jobs.clone() {
        let matches = glob::glob(&pattern)
            .map_err(|e| FerryError::Config(format!("bad include pattern '{pattern}': {e}")))?;
        for entry in matches {
            let include = entry
                .map_err(|e| FerryError::Config(format!("include '{pattern}': {e}")))?;
            debug!(file = %include.display(), "merging included jobs");
            doc.jobs.extend(parse_job_document(&include)?);
        }
    }

    validate(&doc)?;
    Ok(doc)
}

fn validate(doc: &ConfigDocument) -> Result<()> {
    let mut seen_jobs = std::collections::HashSet::new();
    for job in &doc.jobs {
        if !seen_jobs.insert(job.job_name.as_str()) {
            return Err(FerryError::Config(format!(
                "duplicate job name: '{}'",
                job.job_name
            )));
        }
        if job.storages_options.is_empty() {
            return Err(FerryError::Config(format!(
                "job '{}' has no storages",
                job.job_name
            )));
        }
        for opt in &job.storages_options {
            let known = opt.storage_name == "local"
                || doc.storage_connects.iter().any(|c| c.name == opt.storage_name);
            if !known {
                return Err(FerryError::Config(format!(
                    "job '{}' references unknown storage '{}'",
                    job.job_name, opt.storage_name
                )));
            }
        }
    }

    let mut seen_storages = std::collections::HashSet::new();
    for connect in &doc.storage_connects {
        if !seen_storages.insert(connect.name.as_str()) {
            return Err(FerryError::Config(format!(
                "duplicate storage name: '{}'",
                connect.name
            )));
        }
    }
    Ok(())
}

/// Starter config printed by `ferry generate`.
pub fn config_template() -> &'static str {
    r#"server_name: ${HOSTNAME:-backup-host}
project_name: my-project
loglevel: info
# logfile: /var/log/ferry/ferry.log

notifications:
  webhooks: []
  # - https://alerts.example.com/hooks/backup

metrics:
  enabled: false
  # textfile_path: /var/lib/node_exporter/textfile/ferry.prom

storage_connects: []
# - name: offsite
#   kind: s3
#   bucket: backups
#   endpoint: https://s3.example.com
#   access_key_id: ${S3_ACCESS_KEY:-}
#   secret_access_key: ${S3_SECRET_KEY:-}

jobs:
  - job_name: etc
    type: desc_files
    tmp_dir: /var/tmp/ferry
    safety_backup: false
    deferred_copying: false
    disk_rate_limit: "0"
    storages_options:
      - storage_name: local
        backup_path: /var/backups/ferry
        retention:
          daily: 7
          weekly: 4
          monthly: 6
    sources:
      - paths: [/etc]
        gzip: true

include_jobs: []
# - /etc/ferry/jobs.d/*.yaml
"#
}
