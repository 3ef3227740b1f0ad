use cx_object_store::ObjectStoreError;
use thiserror::Error;

use crate::job::JobStatus;

#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error("State document is corrupt: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State document changed concurrently, gave up after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("No completed jobs available")]
    NoCompletedJobs,

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Unknown job status: {0}")]
    UnknownStatus(String),
}

pub type Result<T> = std::result::Result<T, StateStoreError>;

impl StateStoreError {
    /// Whether the state document itself is missing (not yet initialized)
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateStoreError::ObjectStore(e) if e.is_not_found())
    }
}
