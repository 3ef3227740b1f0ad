//! Job payloads in the bucket
//!
//! Layout under `job-{id}/`:
//!
//! ```text
//! job-{id}/input.tar.gz                 uploaded at launch
//! job-{id}/output/...                   written by the instance
//! job-{id}/logs/cloud-init-output.log   written by the instance
//! ```

use std::path::{Component, Path, PathBuf};

use cx_object_store::ObjectStoreClient;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};

pub const INPUT_ARCHIVE: &str = "input.tar.gz";
pub const LOG_FILE: &str = "cloud-init-output.log";

/// `job-{id}/`, with the trailing slash so `job-1` never matches `job-10`
pub fn job_prefix(job_id: i64) -> String {
    format!("job-{}/", job_id)
}

pub fn input_key(job_id: i64) -> String {
    format!("{}{}", job_prefix(job_id), INPUT_ARCHIVE)
}

pub fn output_prefix(job_id: i64) -> String {
    format!("{}output/", job_prefix(job_id))
}

pub fn log_key(job_id: i64) -> String {
    format!("{}logs/{}", job_prefix(job_id), LOG_FILE)
}

/// What `download_outputs` wrote locally
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub files: Vec<PathBuf>,
    pub log: Option<PathBuf>,
}

impl PullSummary {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.log.is_none()
    }
}

/// gzip-compressed tar of `dir`, entries rooted at `input/`.
///
/// Symlinks are archived as the files they point to.
pub async fn archive_directory(dir: &Path) -> Result<Vec<u8>> {
    if !dir.is_dir() {
        return Err(OrchestratorError::payload(format!(
            "input directory {} does not exist",
            dir.display()
        )));
    }

    let dir = dir.to_path_buf();
    let bytes = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(true);
        builder.append_dir_all("input", &dir)?;
        builder.into_inner()?.finish()
    })
    .await
    .map_err(|e| OrchestratorError::payload(format!("archive task failed: {}", e)))??;

    Ok(bytes)
}

/// Archive `dir` and upload it as the job's input. Returns the archive size.
pub async fn upload_input(client: &ObjectStoreClient, job_id: i64, dir: &Path) -> Result<usize> {
    let archive = archive_directory(dir).await?;
    if archive.is_empty() {
        return Err(OrchestratorError::payload("input archive is empty"));
    }

    let key = input_key(job_id);
    info!(job_id, key = %key, bytes = archive.len(), "Uploading input archive");
    client.put(&key, &archive).await?;
    Ok(archive.len())
}

/// Download `job-{id}/output/**` and the stored log into `dest`
pub async fn download_outputs(
    client: &ObjectStoreClient,
    job_id: i64,
    dest: &Path,
) -> Result<PullSummary> {
    let prefix = output_prefix(job_id);
    let keys = client.list(&prefix).await?;
    let log = match client.get(&log_key(job_id)).await {
        Ok(bytes) => Some(bytes),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };

    let mut summary = PullSummary::default();
    if keys.is_empty() && log.is_none() {
        return Ok(summary);
    }
    tokio::fs::create_dir_all(dest).await?;

    for key in keys.iter().filter(|k| !k.ends_with('/')) {
        let relative = safe_relative(key.trim_start_matches(prefix.as_str()))?;
        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = client.get(key).await?;
        tokio::fs::write(&target, &body).await?;
        debug!(key = %key, path = %target.display(), "Downloaded object");
        summary.files.push(target);
    }

    if let Some(body) = log {
        let target = dest.join(LOG_FILE);
        tokio::fs::write(&target, &body).await?;
        summary.log = Some(target);
    }

    info!(job_id, files = summary.files.len(), log = summary.log.is_some(), "Job output downloaded");
    Ok(summary)
}

/// Delete every object under `job-{id}/`. Returns how many were removed.
pub async fn delete_job_objects(client: &ObjectStoreClient, job_id: i64) -> Result<usize> {
    let keys = client.list(&job_prefix(job_id)).await?;
    for key in &keys {
        client.delete(key).await?;
    }
    if !keys.is_empty() {
        info!(job_id, objects = keys.len(), "Deleted job objects");
    }
    Ok(keys.len())
}

/// Object key suffix as a relative path that cannot escape the destination
fn safe_relative(suffix: &str) -> Result<PathBuf> {
    let path = Path::new(suffix);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || suffix.is_empty() {
        return Err(OrchestratorError::payload(format!(
            "refusing to write object outside destination: {}",
            suffix
        )));
    }
    Ok(path.to_path_buf())
}
