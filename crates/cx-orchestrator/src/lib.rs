//! cx-orchestrator - Job Workflows on DigitalOcean
//!
//! Composes the job registry with the things a job needs outside the state
//! document:
//!
//! - `ComputeProvider`: droplets (REST via reqwest in `DigitalOceanProvider`)
//! - `RemoteShell`: SSH keys, host entries, log tail, tmux attach (`OpenSshShell`)
//! - `payload`: input archive upload, output download, per-job cleanup

pub mod compute;
pub mod digitalocean;
pub mod error;
pub mod orchestrator;
pub mod payload;
pub mod shell;

pub use compute::{ComputeProvider, InstanceSpec};
pub use digitalocean::DigitalOceanProvider;
pub use error::{OrchestratorError, Result};
pub use orchestrator::{CancelOutcome, CancelSummary, JobLogs, LaunchRequest, Orchestrator};
pub use payload::PullSummary;
pub use shell::{host_alias, OpenSshShell, RemoteShell};
