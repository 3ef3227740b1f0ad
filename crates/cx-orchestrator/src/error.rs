use cx_object_store::ObjectStoreError;
use cx_state_store::{JobStatus, StateStoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error("Compute provider error: {0}")]
    Compute(String),

    #[error("Remote shell error: {0}")]
    Shell(String),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job {id} is not running, it is {status}")]
    NotRunning { id: i64, status: JobStatus },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn compute(message: impl ToString) -> Self {
        OrchestratorError::Compute(message.to_string())
    }

    pub fn shell(message: impl ToString) -> Self {
        OrchestratorError::Shell(message.to_string())
    }

    pub fn payload(message: impl ToString) -> Self {
        OrchestratorError::Payload(message.to_string())
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(e: reqwest::Error) -> Self {
        OrchestratorError::Compute(e.to_string())
    }
}
