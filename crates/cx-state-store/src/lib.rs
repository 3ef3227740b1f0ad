//! cx-state-store - Job Ledger on Object Storage
//!
//! The whole job ledger is one JSON document, `state/state.json`, in the user's
//! bucket. Every client reads it, merges its own change and writes it back.
//!
//! Job lifecycle:
//! PROVISIONING → RUNNING → COMPLETED/FAILED/TIMEDOUT, and CANCELLED from
//! either of the first two.
//!
//! Features:
//! - Read-merge-write reconciliation with tombstone deltas
//! - Last-writer-wins or optimistic (If-Match) writes
//! - Id-indexed, insertion-ordered job collection

pub mod error;
pub mod job;
pub mod registry;
pub mod state;
pub mod store;

pub use error::{Result, StateStoreError};
pub use job::{unix_now, InstanceSize, Job, JobStatus, ResourceHandle, NO_NAME};
pub use registry::JobRegistry;
pub use state::{MergeSummary, State};
pub use store::{StateStore, OPTIMISTIC_CYCLES, STATE_DIR, STATE_KEY};
