//! Persistence of the state document
//!
//! Every write is a read-merge-write cycle against `state/state.json`. There is
//! no lock: in last-writer-wins mode a concurrent writer whose read predates our
//! write loses its update. Optimistic mode makes the write conditional on the
//! ETag that was read and replays the cycle when it no longer matches.

use std::sync::Arc;

use cx_core::ConsistencyMode;
use cx_object_store::{digest, ObjectStoreClient, ObjectStoreError, RetryPolicy};
use tracing::{debug, info, warn};

use crate::error::{Result, StateStoreError};
use crate::state::State;

/// Directory placeholder created next to the document
pub const STATE_DIR: &str = "state/";
pub const STATE_KEY: &str = "state/state.json";

/// Read-merge-write cycles attempted in optimistic mode before giving up
pub const OPTIMISTIC_CYCLES: u32 = 3;

pub struct StateStore {
    client: Arc<ObjectStoreClient>,
    consistency: ConsistencyMode,
    write_retry: RetryPolicy,
}

impl StateStore {
    pub fn new(client: Arc<ObjectStoreClient>) -> Self {
        let write_retry = client.retry_policy();
        Self {
            client,
            consistency: ConsistencyMode::default(),
            write_retry,
        }
    }

    pub fn with_consistency(mut self, consistency: ConsistencyMode) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    pub fn consistency(&self) -> ConsistencyMode {
        self.consistency
    }

    pub fn client(&self) -> &Arc<ObjectStoreClient> {
        &self.client
    }

    /// Create the `state/` placeholder and an empty document when missing.
    ///
    /// Returns whether the document had to be created.
    pub async fn initialize(&self) -> Result<bool> {
        if !self.client.exists(STATE_DIR).await? {
            info!("Creating new state directory");
            self.client.put(STATE_DIR, &[]).await?;
        }

        if self.client.exists(STATE_KEY).await? {
            debug!("State document already present");
            return Ok(false);
        }

        info!("Creating new state file");
        self.client.put(STATE_KEY, b"{}").await?;
        Ok(true)
    }

    /// Current state for display: unnamed jobs carry the placeholder name
    pub async fn get_state(&self) -> Result<State> {
        let (mut state, _) = self.read_document().await?;
        state.normalize_names();
        Ok(state)
    }

    /// Merge `delta` into the persisted document and write it back.
    ///
    /// Returns the merged state as written.
    pub async fn merge_and_save(&self, delta: &State) -> Result<State> {
        self.update_with(|_| Ok(delta.clone())).await
    }

    /// Read the document, derive a delta from it with `build_delta`, merge and
    /// write back. An `Err` from `build_delta` aborts before anything is
    /// written.
    ///
    /// `build_delta` sees the document as stored (names not normalized) and is
    /// called again for every optimistic replay, so ids and validations always
    /// reflect the latest read.
    pub async fn update_with<F>(&self, mut build_delta: F) -> Result<State>
    where
        F: FnMut(&State) -> Result<State> + Send,
    {
        let cycles = match self.consistency {
            ConsistencyMode::LastWriterWins => 1,
            ConsistencyMode::Optimistic => OPTIMISTIC_CYCLES,
        };

        for cycle in 1..=cycles {
            let (mut state, etag) = self.read_document().await?;
            let delta = build_delta(&state)?;
            let summary = state.merge(&delta);
            let bytes = serde_json::to_vec(&state)?;

            let if_match = match self.consistency {
                ConsistencyMode::LastWriterWins => None,
                ConsistencyMode::Optimistic => Some(etag.as_str()),
            };

            match self.write_document(&bytes, if_match).await {
                Ok(()) => {
                    debug!(
                        added = summary.added,
                        replaced = summary.replaced,
                        removed = summary.removed,
                        jobs = state.len(),
                        "State saved"
                    );
                    return Ok(state);
                }
                Err(StateStoreError::ObjectStore(ObjectStoreError::PreconditionFailed { .. })) => {
                    warn!(cycle, "State changed since it was read, replaying update");
                }
                Err(e) => return Err(e),
            }
        }

        Err(StateStoreError::Conflict { attempts: cycles })
    }

    async fn read_document(&self) -> Result<(State, String)> {
        let object = self.client.get_versioned(STATE_KEY).await?;
        let state: State = serde_json::from_slice(&object.body)
            .map_err(|e| StateStoreError::Schema(e.to_string()))?;
        Ok((state, object.etag))
    }

    /// Single write, retried on transient failures only.
    ///
    /// A transient failure may hide a put that did land. A conditional retry
    /// then fails its precondition against our own bytes, so that case is
    /// checked against the stored ETag before reporting a conflict.
    async fn write_document(&self, bytes: &[u8], if_match: Option<&str>) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.client.put_conditional(STATE_KEY, bytes, if_match).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() && !self.write_retry.is_last(attempt) => {
                    warn!(attempt, error = %e, "State write failed, retrying");
                    tokio::time::sleep(self.write_retry.delay_after(attempt)).await;
                    attempt += 1;
                }
                Err(e @ ObjectStoreError::PreconditionFailed { .. }) if attempt > 1 => {
                    if self.document_matches(bytes).await? {
                        info!(attempt, "Earlier state write landed despite the error");
                        return Ok(());
                    }
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Whether the stored document is exactly `bytes`
    async fn document_matches(&self, bytes: &[u8]) -> Result<bool> {
        let object = self.client.get_versioned(STATE_KEY).await?;
        Ok(digest::etag_matches(&object.etag, bytes))
    }
}
