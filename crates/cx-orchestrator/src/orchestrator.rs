//! Job workflows
//!
//! Sequences the registry, the bucket, the compute provider and the remote
//! shell. Nothing is rolled back: a failure after an instance was created
//! leaves it running, and `orphaned_instances` reports it later.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cx_core::Identity;
use cx_object_store::ObjectStoreClient;
use cx_state_store::{Job, JobRegistry, JobStatus, ResourceHandle, StateStoreError};
use tracing::{info, warn};

use crate::compute::{ComputeProvider, InstanceSpec};
use crate::error::{OrchestratorError, Result};
use crate::payload::{self, PullSummary};
use crate::shell::RemoteShell;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub name: String,
    pub input_dir: PathBuf,
    pub region: String,
    pub size: String,
    pub user_data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled(Job),
    /// The job was already in this (terminal) status; nothing was touched
    NotActive(JobStatus),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelSummary {
    pub cancelled: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLogs {
    /// Followed live from the instance
    Streamed,
    /// Log saved by the instance when the job ended
    Stored(Vec<u8>),
}

pub struct Orchestrator {
    registry: JobRegistry,
    identity: Identity,
    compute: Arc<dyn ComputeProvider>,
    shell: Arc<dyn RemoteShell>,
}

impl Orchestrator {
    pub fn new(
        registry: JobRegistry,
        identity: Identity,
        compute: Arc<dyn ComputeProvider>,
        shell: Arc<dyn RemoteShell>,
    ) -> Self {
        Self {
            registry,
            identity,
            compute,
            shell,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    fn objects(&self) -> &ObjectStoreClient {
        self.registry.store().client()
    }

    /// Allocate a job, upload its input, boot its instance and wait for SSH
    pub async fn launch(&self, request: &LaunchRequest) -> Result<Job> {
        if !request.input_dir.is_dir() {
            return Err(OrchestratorError::payload(format!(
                "input directory {} does not exist",
                request.input_dir.display()
            )));
        }

        let job = self.registry.create_job(&request.name).await?;
        let job_id = job.id;
        info!(job_id, name = %request.name, "Launching job");

        payload::upload_input(self.objects(), job_id, &request.input_dir).await?;

        let public_key = self.shell.ensure_key_pair().await?;
        let spec = InstanceSpec {
            name: self.identity.instance_name(job_id),
            region: request.region.clone(),
            size: request.size.clone(),
            user_data: request.user_data.clone(),
            tags: self.identity.instance_tags(job_id),
            key_name: self.identity.key_name(),
            public_key,
        };
        let handle = self.compute.create_instance(&spec).await?;
        let ip = handle.ip.clone();

        let job = self.registry.attach_resource_handle(job_id, handle).await?;
        self.shell.register_host(job_id, &ip).await?;
        self.shell.wait_until_reachable(job_id).await?;

        info!(job_id, ip = %ip, "Launch complete");
        Ok(job)
    }

    /// Destroy the instance of an active job and mark it cancelled
    pub async fn cancel_job(&self, id: i64) -> Result<CancelOutcome> {
        let job = self.registry.get_job(id).await?;
        if !job.is_active() {
            info!(job_id = id, status = %job.status, "Job is not running");
            return Ok(CancelOutcome::NotActive(job.status));
        }

        match &job.droplet {
            Some(handle) => {
                info!(job_id = id, droplet_id = handle.id, ip = %handle.ip, "Destroying instance");
                self.compute.delete_instance(handle.id).await?;
            }
            None => warn!(job_id = id, "Job has no instance to destroy"),
        }

        let job = self.registry.mark_cancelled(id).await?;
        self.shell.forget_host(id).await?;
        Ok(CancelOutcome::Cancelled(job))
    }

    /// Cancel every active job, carrying on past individual failures
    pub async fn cancel_all(&self) -> Result<CancelSummary> {
        let state = self.registry.state().await?;
        let active: Vec<i64> = state.active_jobs().map(|job| job.id).collect();

        let mut summary = CancelSummary::default();
        for id in active {
            match self.cancel_job(id).await {
                Ok(CancelOutcome::Cancelled(_)) => summary.cancelled += 1,
                Ok(CancelOutcome::NotActive(_)) => {}
                Err(e) => {
                    warn!(job_id = id, error = %e, "Failed to cancel job");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Remove everything a job left behind: instance (if still active),
    /// bucket objects, state record and SSH host entry.
    ///
    /// Returns the number of deleted objects.
    pub async fn clean_job(&self, id: i64) -> Result<usize> {
        let job = match self.registry.get_job(id).await {
            Ok(job) => Some(job),
            Err(StateStoreError::JobNotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        if job.as_ref().map_or(false, Job::is_active) {
            self.cancel_job(id).await?;
        }

        let deleted = payload::delete_job_objects(self.objects(), id).await?;
        if job.is_some() {
            self.registry.delete_job(id).await?;
        }
        self.shell.forget_host(id).await?;

        info!(job_id = id, objects = deleted, "Job cleaned");
        Ok(deleted)
    }

    /// `clean_job` for every recorded job. Returns the total deleted objects.
    pub async fn clean_all(&self) -> Result<usize> {
        let state = self.registry.state().await?;
        let ids: Vec<i64> = state.jobs().iter().map(|job| job.id).collect();

        let mut deleted = 0;
        for id in ids {
            deleted += self.clean_job(id).await?;
        }
        Ok(deleted)
    }

    /// Download a job's outputs and stored log into `dest`
    pub async fn pull(&self, id: i64, dest: &Path) -> Result<PullSummary> {
        // fails with JobNotFound for unknown ids
        self.registry.get_job(id).await?;
        payload::download_outputs(self.objects(), id, dest).await
    }

    /// Live logs for an active job, the stored log otherwise
    pub async fn job_logs(&self, id: i64) -> Result<JobLogs> {
        let job = self.registry.get_job(id).await?;
        if job.is_active() && job.droplet.is_some() {
            self.shell.stream_logs(id).await?;
            return Ok(JobLogs::Streamed);
        }
        let log = self.objects().get(&payload::log_key(id)).await?;
        Ok(JobLogs::Stored(log))
    }

    pub async fn attach(&self, id: i64) -> Result<()> {
        let job = self.registry.get_job(id).await?;
        if job.status != JobStatus::Running {
            return Err(OrchestratorError::NotRunning {
                id,
                status: job.status,
            });
        }
        self.shell.attach(id).await
    }

    /// Instances tagged with this user's owner tag that no job record references
    pub async fn orphaned_instances(&self) -> Result<Vec<ResourceHandle>> {
        let state = self.registry.state().await?;
        let known: HashSet<i64> = state
            .jobs()
            .iter()
            .filter_map(|job| job.droplet.as_ref().map(|h| h.id))
            .collect();

        let instances = self
            .compute
            .list_instances_by_tag(&self.identity.owner_tag())
            .await?;
        Ok(instances
            .into_iter()
            .filter(|instance| !known.contains(&instance.id))
            .collect())
    }
}
