//! Turn a validated config document into runnable jobs.

use std::collections::BTreeMap;

use crate::error::{FerryError, Result};
use crate::job::Job;
use crate::limits::parse_rate;
use crate::naming::join_remote;
use crate::storage::local::LocalTransport;
use crate::storage::remote::RemoteTransport;
use crate::storage::{Storage, Transport};

use super::sources::parse_sources;
use super::types::{ConfigDocument, JobStorageSpec, StorageConnect, TransportConfig};

fn build_transport(connect: &TransportConfig) -> Result<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match connect {
        TransportConfig::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
        } => Box::new(RemoteTransport::s3(
            bucket,
            region,
            endpoint.as_deref(),
            access_key_id,
            secret_access_key,
        )?),
        TransportConfig::Sftp {
            host,
            port,
            user,
            key_file,
        } => Box::new(RemoteTransport::sftp(host, *port, user, key_file.as_deref())?),
        TransportConfig::Ftp {
            host,
            port,
            user,
            password,
        } => Box::new(RemoteTransport::ftp(host, *port, user, password)?),
        TransportConfig::Webdav {
            endpoint,
            user,
            password,
        } => Box::new(RemoteTransport::webdav(endpoint, user, password)?),
        TransportConfig::Smb { .. } => Box::new(LocalTransport::mounted("smb")),
        TransportConfig::Nfs { .. } => Box::new(LocalTransport::mounted("nfs")),
    };
    Ok(transport)
}

fn build_storage(connects: &[StorageConnect], spec: &JobStorageSpec) -> Result<Storage> {
    let rate_limit = parse_rate(spec.rate_limit.as_deref().unwrap_or(""))?;

    if spec.storage_name == "local" {
        return Ok(Storage::new(
            "local",
            spec.backup_path.clone(),
            rate_limit,
            spec.enable_rotate,
            spec.retention.clone(),
            Box::new(LocalTransport::new()),
        ));
    }

    let connect = connects
        .iter()
        .find(|c| c.name == spec.storage_name)
        .ok_or_else(|| {
            FerryError::Config(format!("unknown storage '{}'", spec.storage_name))
        })?;

    // Mounted shares anchor the backup path below their mount point; object
    // stores treat it as a key prefix.
    let backup_path = match &connect.params {
        TransportConfig::Smb { mount_path } | TransportConfig::Nfs { mount_path } => {
            join_remote(&[&mount_path.to_string_lossy(), &spec.backup_path])
        }
        TransportConfig::S3 { .. } => spec.backup_path.trim_matches('/').to_string(),
        _ => spec.backup_path.clone(),
    };

    Ok(Storage::new(
        connect.name.clone(),
        backup_path,
        rate_limit,
        spec.enable_rotate,
        spec.retention.clone(),
        build_transport(&connect.params)?,
    ))
}

/// Build every job in the document. Source schemas, rate strings and
/// storage references have already been shape-checked; this step constructs
/// live transports and expands targets.
pub fn build_jobs(doc: &ConfigDocument) -> Result<Vec<Job>> {
    let mut jobs = Vec::with_capacity(doc.jobs.len());
    for spec in &doc.jobs {
        let targets = parse_sources(spec.kind, &spec.sources)
            .map_err(|e| FerryError::Config(format!("job '{}': {e}", spec.job_name)))?;

        let mut storages = Vec::with_capacity(spec.storages_options.len());
        for opt in &spec.storages_options {
            storages.push(build_storage(&doc.storage_connects, opt).map_err(|e| {
                FerryError::Config(format!("job '{}': {e}", spec.job_name))
            })?);
        }

        jobs.push(Job {
            name: spec.job_name.clone(),
            kind: spec.kind,
            tmp_dir: spec.tmp_dir.clone(),
            enabled: spec.enabled,
            safety_backup: spec.safety_backup,
            deferred_copying: spec.deferred_copying,
            disk_rate_limit: parse_rate(spec.disk_rate_limit.as_deref().unwrap_or(""))?,
            storages,
            targets: targets.into_iter().collect::<BTreeMap<_, _>>(),
            dumped: BTreeMap::new(),
        });
    }
    Ok(jobs)
}
