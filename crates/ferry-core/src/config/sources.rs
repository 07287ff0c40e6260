//! Per-type `sources` schemas and their expansion into targets.
//!
//! Each job type has its own shape, validated strictly: unknown keys are
//! rejected at load time, not discovered mid-run.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{FerryError, Result};
use crate::job::{DbConnect, JobType, Target, TargetParams};
use crate::naming;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSource {
    paths: Vec<PathBuf>,
    #[serde(default)]
    excludes: Vec<String>,
    #[serde(default)]
    save_abs_path: bool,
    #[serde(default)]
    gzip: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MysqlSource {
    name: String,
    connect: DbConnect,
    target_dbs: Vec<String>,
    #[serde(default)]
    exclude_dbs: Vec<String>,
    /// `db.table` entries, filtered per database.
    #[serde(default)]
    ignore_tables: Vec<String>,
    #[serde(default)]
    extra_keys: Vec<String>,
    #[serde(default)]
    gzip: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PostgresSource {
    name: String,
    connect: DbConnect,
    target_dbs: Vec<String>,
    #[serde(default)]
    exclude_dbs: Vec<String>,
    #[serde(default)]
    exclude_tables: Vec<String>,
    #[serde(default)]
    extra_keys: Vec<String>,
    #[serde(default)]
    gzip: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PhysicalSource {
    name: String,
    connect: DbConnect,
    #[serde(default)]
    extra_keys: Vec<String>,
    #[serde(default)]
    gzip: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MongoSource {
    name: String,
    connect: DbConnect,
    target_dbs: Vec<String>,
    #[serde(default)]
    exclude_dbs: Vec<String>,
    /// Bare collection names; empty dumps whole databases.
    #[serde(default)]
    target_collections: Vec<String>,
    /// `db.collection` entries excluded per database.
    #[serde(default)]
    exclude_collections: Vec<String>,
    #[serde(default)]
    extra_keys: Vec<String>,
    #[serde(default)]
    gzip: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RedisSource {
    name: String,
    connect: DbConnect,
    #[serde(default)]
    extra_keys: Vec<String>,
    #[serde(default)]
    gzip: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExternalSource {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    gzip: bool,
}

fn parse_value<T: serde::de::DeserializeOwned>(kind: JobType, value: &serde_yaml::Value) -> Result<T> {
    serde_yaml::from_value(value.clone())
        .map_err(|e| FerryError::Config(format!("invalid '{kind}' source: {e}")))
}

/// Entries like `db.table` that belong to `db`, with the prefix stripped.
fn scoped_to(db: &str, entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|e| e.strip_prefix(db).and_then(|r| r.strip_prefix('.')))
        .map(str::to_string)
        .collect()
}

fn forbid_keys(kind: JobType, extra: &[String], forbidden: &[&str]) -> Result<()> {
    for key in extra {
        for marker in forbidden {
            if key.starts_with(marker) {
                return Err(FerryError::Config(format!(
                    "'{marker}' must not appear in extra_keys of a '{kind}' job"
                )));
            }
        }
    }
    Ok(())
}

fn push_target(
    out: &mut Vec<(String, Target)>,
    ofs: String,
    target: Target,
) -> Result<()> {
    if out.iter().any(|(existing, _)| existing == &ofs) {
        return Err(FerryError::Config(format!("duplicate target '{ofs}'")));
    }
    out.push((ofs, target));
    Ok(())
}

/// Expand a job's raw `sources` into `(OFS, Target)` pairs.
pub fn parse_sources(
    kind: JobType,
    raw: &[serde_yaml::Value],
) -> Result<Vec<(String, Target)>> {
    if raw.is_empty() {
        return Err(FerryError::Config(format!(
            "a '{kind}' job needs at least one source"
        )));
    }

    let mut out = Vec::new();
    for value in raw {
        match kind {
            JobType::DescFiles | JobType::IncFiles => {
                let src: FileSource = parse_value(kind, value)?;
                for path in &src.paths {
                    if !path.is_absolute() {
                        return Err(FerryError::Config(format!(
                            "file source paths must be absolute: '{}'",
                            path.display()
                        )));
                    }
                    push_target(
                        &mut out,
                        naming::ofs_from_path(path),
                        Target {
                            source_name: path.display().to_string(),
                            gzip: src.gzip,
                            params: TargetParams::Files {
                                path: path.clone(),
                                excludes: src.excludes.clone(),
                                save_abs_path: src.save_abs_path,
                            },
                        },
                    )?;
                }
            }
            JobType::Mysql => {
                let src: MysqlSource = parse_value(kind, value)?;
                for db in src.target_dbs.iter().filter(|db| !src.exclude_dbs.contains(db)) {
                    push_target(
                        &mut out,
                        format!("{}/{db}", src.name),
                        Target {
                            source_name: src.name.clone(),
                            gzip: src.gzip,
                            params: TargetParams::Mysql {
                                conn: src.connect.clone(),
                                db: db.clone(),
                                ignore_tables: scoped_to(db, &src.ignore_tables),
                                extra_args: src.extra_keys.clone(),
                            },
                        },
                    )?;
                }
            }
            JobType::MysqlXtrabackup => {
                let src: PhysicalSource = parse_value(kind, value)?;
                forbid_keys(kind, &src.extra_keys, &["--target-dir"])?;
                push_target(
                    &mut out,
                    src.name.clone(),
                    Target {
                        source_name: src.name.clone(),
                        gzip: src.gzip,
                        params: TargetParams::MysqlXtrabackup {
                            conn: src.connect.clone(),
                            extra_args: src.extra_keys.clone(),
                        },
                    },
                )?;
            }
            JobType::Postgresql => {
                let src: PostgresSource = parse_value(kind, value)?;
                for db in src.target_dbs.iter().filter(|db| !src.exclude_dbs.contains(db)) {
                    push_target(
                        &mut out,
                        format!("{}/{db}", src.name),
                        Target {
                            source_name: src.name.clone(),
                            gzip: src.gzip,
                            params: TargetParams::Postgresql {
                                conn: src.connect.clone(),
                                db: db.clone(),
                                exclude_tables: src.exclude_tables.clone(),
                                extra_args: src.extra_keys.clone(),
                            },
                        },
                    )?;
                }
            }
            JobType::PostgresqlBasebackup => {
                let src: PhysicalSource = parse_value(kind, value)?;
                forbid_keys(kind, &src.extra_keys, &["--pgdata", "-D"])?;
                push_target(
                    &mut out,
                    src.name.clone(),
                    Target {
                        source_name: src.name.clone(),
                        gzip: src.gzip,
                        params: TargetParams::PostgresqlBasebackup {
                            conn: src.connect.clone(),
                            extra_args: src.extra_keys.clone(),
                        },
                    },
                )?;
            }
            JobType::Mongodb => {
                let src: MongoSource = parse_value(kind, value)?;
                for db in src.target_dbs.iter().filter(|db| !src.exclude_dbs.contains(db)) {
                    let excluded = scoped_to(db, &src.exclude_collections);
                    let collections: Vec<String> = src
                        .target_collections
                        .iter()
                        .filter(|c| !excluded.contains(c))
                        .cloned()
                        .collect();
                    let mut extra_args = src.extra_keys.clone();
                    if src.target_collections.is_empty() {
                        // Whole-db dump: excludes ride along as flags.
                        extra_args
                            .extend(excluded.iter().map(|c| format!("--excludeCollection={c}")));
                    }
                    push_target(
                        &mut out,
                        format!("{}/{db}", src.name),
                        Target {
                            source_name: src.name.clone(),
                            gzip: src.gzip,
                            params: TargetParams::Mongodb {
                                conn: src.connect.clone(),
                                db: db.clone(),
                                collections,
                                extra_args,
                            },
                        },
                    )?;
                }
            }
            JobType::Redis => {
                let src: RedisSource = parse_value(kind, value)?;
                push_target(
                    &mut out,
                    src.name.clone(),
                    Target {
                        source_name: src.name.clone(),
                        gzip: src.gzip,
                        params: TargetParams::Redis {
                            conn: src.connect.clone(),
                            extra_args: src.extra_keys.clone(),
                        },
                    },
                )?;
            }
            JobType::External => {
                let src: ExternalSource = parse_value(kind, value)?;
                push_target(
                    &mut out,
                    src.name.clone(),
                    Target {
                        source_name: src.name.clone(),
                        gzip: src.gzip,
                        params: TargetParams::External {
                            command: src.command.clone(),
                            args: src.args.clone(),
                            env: src.env.clone(),
                        },
                    },
                )?;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn file_sources_expand_per_path() {
        let raw = vec![yaml(
            r#"
paths: [/var/www, /etc/nginx]
excludes: ["*.sock"]
gzip: true
"#,
        )];
        let targets = parse_sources(JobType::DescFiles, &raw).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].0, "var___www");
        assert_eq!(targets[1].0, "etc___nginx");
        assert!(targets.iter().all(|(_, t)| t.gzip));
    }

    #[test]
    fn relative_file_path_is_config_error() {
        let raw = vec![yaml("paths: [relative/path]")];
        let err = parse_sources(JobType::DescFiles, &raw).unwrap_err();
        assert!(matches!(err, FerryError::Config(_)));
    }

    #[test]
    fn mysql_expands_dbs_and_scopes_ignores() {
        let raw = vec![yaml(
            r#"
name: prod
connect: {host: db1, user: backup, password: s3cret}
target_dbs: [app, sessions, scratch]
exclude_dbs: [scratch]
ignore_tables: [app.cache, sessions.tmp, other.x]
"#,
        )];
        let targets = parse_sources(JobType::Mysql, &raw).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].0, "prod/app");
        match &targets[0].1.params {
            TargetParams::Mysql { ignore_tables, .. } => {
                assert_eq!(ignore_tables, &["cache".to_string()]);
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }

    #[test]
    fn basebackup_rejects_pgdata_extra_key() {
        let raw = vec![yaml(
            r#"
name: main
connect: {host: db, user: postgres, password: pw}
extra_keys: ["--pgdata=/elsewhere"]
"#,
        )];
        let err = parse_sources(JobType::PostgresqlBasebackup, &raw).unwrap_err();
        assert!(err.to_string().contains("--pgdata"));
    }

    #[test]
    fn unknown_source_keys_are_rejected() {
        let raw = vec![yaml("paths: [/a]\nsurprise: true")];
        assert!(parse_sources(JobType::DescFiles, &raw).is_err());
    }

    #[test]
    fn duplicate_ofs_is_config_error() {
        let raw = vec![yaml("paths: [/a]"), yaml("paths: [/a]")];
        let err = parse_sources(JobType::DescFiles, &raw).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn mongo_whole_db_excludes_become_flags() {
        let raw = vec![yaml(
            r#"
name: m
connect: {host: mongo, user: u, password: p}
target_dbs: [app]
exclude_collections: [app.audit]
"#,
        )];
        let targets = parse_sources(JobType::Mongodb, &raw).unwrap();
        match &targets[0].1.params {
            TargetParams::Mongodb {
                collections,
                extra_args,
                ..
            } => {
                assert!(collections.is_empty());
                assert_eq!(extra_args, &["--excludeCollection=audit".to_string()]);
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }

    #[test]
    fn empty_sources_rejected() {
        assert!(parse_sources(JobType::Redis, &[]).is_err());
    }
}
