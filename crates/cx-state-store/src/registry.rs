//! Job registry
//!
//! Builds deltas for job creation and updates. Each mutation derives its delta
//! from the document read in the same cycle, so ids and lifecycle checks are
//! evaluated against what is actually stored.

use tracing::info;

use crate::error::{Result, StateStoreError};
use crate::job::{unix_now, Job, JobStatus, ResourceHandle};
use crate::state::State;
use crate::store::StateStore;

pub struct JobRegistry {
    store: StateStore,
}

impl JobRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub async fn state(&self) -> Result<State> {
        self.store.get_state().await
    }

    pub async fn get_job(&self, id: i64) -> Result<Job> {
        self.state()
            .await?
            .get_job(id)
            .cloned()
            .ok_or(StateStoreError::JobNotFound(id))
    }

    pub async fn latest_job(&self) -> Result<Option<Job>> {
        Ok(self.state().await?.latest_job().cloned())
    }

    pub async fn latest_completed_job(&self) -> Result<Job> {
        self.state()
            .await?
            .latest_completed_job()
            .cloned()
            .ok_or(StateStoreError::NoCompletedJobs)
    }

    /// Allocate the next id and record a `Provisioning` job under it
    pub async fn create_job(&self, name: &str) -> Result<Job> {
        let mut allocated = 0;
        let merged = self
            .store
            .update_with(|current| {
                allocated = current.next_job_id();
                Ok(State::single(Job::new(allocated, name, unix_now())))
            })
            .await?;

        info!(job_id = allocated, name, "Job created");
        merged
            .get_job(allocated)
            .cloned()
            .ok_or(StateStoreError::JobNotFound(allocated))
    }

    /// Bind `handle` to job `id`, carrying every other field forward
    pub async fn attach_resource_handle(&self, id: i64, handle: ResourceHandle) -> Result<Job> {
        let instance_id = handle.id;
        let job = self
            .update_job(id, |job| Ok(job.with_handle(handle.clone(), unix_now())))
            .await?;
        info!(job_id = id, instance_id, "Instance attached to job");
        Ok(job)
    }

    /// Record a status reported for job `id`.
    ///
    /// Transitions outside the lifecycle graph are rejected without writing.
    pub async fn set_status(&self, id: i64, status: JobStatus) -> Result<Job> {
        let job = self
            .update_job(id, |job| {
                if !job.status.can_transition_to(status) {
                    return Err(StateStoreError::InvalidTransition {
                        id,
                        from: job.status,
                        to: status,
                    });
                }
                Ok(job.with_status(status, unix_now()))
            })
            .await?;
        info!(job_id = id, %status, "Job status updated");
        Ok(job)
    }

    /// Cancel a `Provisioning` or `Running` job
    pub async fn mark_cancelled(&self, id: i64) -> Result<Job> {
        self.set_status(id, JobStatus::Cancelled).await
    }

    /// Remove job `id` from the document. Returns whether it was present.
    pub async fn delete_job(&self, id: i64) -> Result<bool> {
        let mut existed = false;
        self.store
            .update_with(|current| {
                existed = current.contains(id);
                Ok(State::single(Job::tombstone(id)))
            })
            .await?;
        if existed {
            info!(job_id = id, "Job record deleted");
        }
        Ok(existed)
    }

    async fn update_job<F>(&self, id: i64, mut change: F) -> Result<Job>
    where
        F: FnMut(&Job) -> Result<Job> + Send,
    {
        let merged = self
            .store
            .update_with(|current| {
                let job = current.get_job(id).ok_or(StateStoreError::JobNotFound(id))?;
                Ok(State::single(change(job)?))
            })
            .await?;
        merged
            .get_job(id)
            .cloned()
            .ok_or(StateStoreError::JobNotFound(id))
    }
}
