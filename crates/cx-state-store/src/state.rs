//! In-memory view of the state document
//!
//! Jobs keep the order in which they were first added; an id index sits next
//! to the list so lookups and in-place replacement do not scan.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StateStoreError;
use crate::job::{Job, JobStatus, NO_NAME};

/// Wire shape of `state/state.json`.
///
/// `jobs` may be missing (the bootstrap `{}` document) or `null` (written by
/// older clients for an empty ledger).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    jobs: Option<Vec<Job>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StateDocument", into = "StateDocument")]
pub struct State {
    jobs: Vec<Job>,
    index: HashMap<i64, usize>,
}

/// What a merge did to the persisted collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub replaced: usize,
    pub removed: usize,
}

impl MergeSummary {
    pub fn is_empty(&self) -> bool {
        self.added + self.replaced + self.removed == 0
    }
}

impl TryFrom<StateDocument> for State {
    type Error = StateStoreError;

    fn try_from(document: StateDocument) -> Result<Self, Self::Error> {
        State::from_jobs(document.jobs.unwrap_or_default())
    }
}

impl From<State> for StateDocument {
    fn from(state: State) -> Self {
        StateDocument {
            jobs: Some(state.jobs),
        }
    }
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from an ordered list of jobs. Ids must be unique.
    pub fn from_jobs(jobs: Vec<Job>) -> Result<Self, StateStoreError> {
        let mut index = HashMap::with_capacity(jobs.len());
        for (position, job) in jobs.iter().enumerate() {
            if index.insert(job.id, position).is_some() {
                return Err(StateStoreError::Schema(format!(
                    "job id {} appears more than once",
                    job.id
                )));
            }
        }
        Ok(Self { jobs, index })
    }

    /// One-entry delta
    pub fn single(job: Job) -> Self {
        let mut state = Self::new();
        state.upsert(job);
        state
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get_job(&self, id: i64) -> Option<&Job> {
        self.index.get(&id).map(|&position| &self.jobs[position])
    }

    /// Replace the job with the same id in place, or append it.
    /// Returns the replaced record.
    pub fn upsert(&mut self, job: Job) -> Option<Job> {
        match self.index.get(&job.id) {
            Some(&position) => Some(std::mem::replace(&mut self.jobs[position], job)),
            None => {
                self.index.insert(job.id, self.jobs.len());
                self.jobs.push(job);
                None
            }
        }
    }

    pub fn remove(&mut self, id: i64) -> Option<Job> {
        let position = self.index.remove(&id)?;
        let removed = self.jobs.remove(position);
        for slot in self.index.values_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    /// Fold `delta` into this state.
    ///
    /// Per delta entry: a tombstone removes a matching job (and is a no-op for
    /// an unknown id), anything else replaces the matching record wholesale or
    /// is appended. Tombstones never land in the collection.
    pub fn merge(&mut self, delta: &State) -> MergeSummary {
        let mut summary = MergeSummary::default();
        for job in &delta.jobs {
            if job.delete {
                if self.remove(job.id).is_some() {
                    summary.removed += 1;
                }
            } else if self.upsert(job.clone()).is_some() {
                summary.replaced += 1;
            } else {
                summary.added += 1;
            }
        }
        summary
    }

    /// Last job by insertion order, not by id or start time
    pub fn latest_job(&self) -> Option<&Job> {
        self.jobs.last()
    }

    /// Most recently inserted job whose status is exactly `Completed`
    pub fn latest_completed_job(&self) -> Option<&Job> {
        self.jobs
            .iter()
            .rev()
            .find(|job| job.status == JobStatus::Completed)
    }

    pub fn active_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|job| job.is_active())
    }

    /// Instance id -> ids of the jobs bound to it. Jobs without an instance
    /// are grouped under `0`.
    pub fn jobs_by_instance(&self) -> BTreeMap<i64, Vec<i64>> {
        let mut by_instance: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for job in &self.jobs {
            let instance = match &job.droplet {
                Some(handle) => handle.id,
                None => {
                    warn!(job_id = job.id, "Job has no instance bound");
                    0
                }
            };
            by_instance.entry(instance).or_default().push(job.id);
        }
        by_instance
    }

    /// `max(id) + 1` over the jobs present now, `1` when empty
    pub fn next_job_id(&self) -> i64 {
        self.jobs.iter().map(|job| job.id).max().map_or(1, |max| max + 1)
    }

    /// Give unnamed jobs the display placeholder
    pub fn normalize_names(&mut self) {
        for job in self.jobs.iter_mut().filter(|job| job.name.is_empty()) {
            job.name = NO_NAME.to_string();
        }
    }
}
