use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::StateStoreError;

/// Shown for jobs launched without a name. Applied on load only, never written.
pub const NO_NAME: &str = "no name";

/// Current time as unix seconds
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Provisioning,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Provisioning,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Provisioning => "provisioning",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::TimedOut => "timedout",
        }
    }

    /// Still holding (or about to hold) a compute instance
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Provisioning | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Lifecycle graph:
    ///
    /// ```text
    /// Provisioning -> Running -> Completed | Failed | TimedOut
    ///      |             |
    ///      +-------------+-----> Cancelled
    /// ```
    ///
    /// Terminal states have no way out and a status never moves to itself.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Provisioning, Running)
                | (Provisioning, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StateStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| StateStoreError::UnknownStatus(s.to_string()))
    }
}

/// Size and price of the instance a job runs on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSize {
    pub slug: String,
    /// MiB
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub vcpus: u32,
    /// GiB
    #[serde(default)]
    pub disk: u64,
    /// USD per hour
    #[serde(default)]
    pub price_hourly: f64,
}

/// The compute instance bound to a job.
///
/// Older clients wrote the fields with capitalized keys, which are still accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(default, alias = "ID")]
    pub id: i64,
    #[serde(default, alias = "IP")]
    pub ip: String,
    /// RFC 3339 creation time as reported by the provider
    #[serde(default, alias = "Created")]
    pub created: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<InstanceSize>,
}

impl ResourceHandle {
    pub fn hourly_price(&self) -> f64 {
        self.size.as_ref().map_or(0.0, |s| s.price_hourly)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub name: String,
    pub id: i64,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub completed_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    pub status: JobStatus,
    /// Tombstone flag, only meaningful inside a merge delta
    #[serde(default, skip_serializing, alias = "Delete")]
    pub delete: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "bound_handle"
    )]
    pub droplet: Option<ResourceHandle>,
}

/// Records written before an instance was attached carry an all-zero droplet
fn bound_handle<'de, D>(deserializer: D) -> Result<Option<ResourceHandle>, D::Error>
where
    D: Deserializer<'de>,
{
    let handle = Option::<ResourceHandle>::deserialize(deserializer)?;
    Ok(handle.filter(|h| h.id != 0))
}

impl Job {
    /// A freshly allocated job waiting for its instance
    pub fn new(id: i64, name: impl Into<String>, now: i64) -> Self {
        Self {
            name: name.into(),
            id,
            started_at: now,
            completed_at: 0,
            updated_at: now,
            status: JobStatus::Provisioning,
            delete: false,
            droplet: None,
        }
    }

    /// Delta entry removing job `id`
    pub fn tombstone(id: i64) -> Self {
        Self {
            delete: true,
            ..Self::new(id, String::new(), 0)
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Copy of this record moved to `status`, stamping `updated_at` and, for
    /// terminal states, `completed_at`.
    pub fn with_status(&self, status: JobStatus, now: i64) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.updated_at = now;
        if status.is_terminal() {
            next.completed_at = now;
        }
        next
    }

    /// Copy of this record bound to `handle`
    pub fn with_handle(&self, handle: ResourceHandle, now: i64) -> Self {
        let mut next = self.clone();
        next.droplet = Some(handle);
        next.updated_at = now;
        next
    }

    /// Seconds the job has been (or was) running
    pub fn elapsed(&self, now: i64) -> i64 {
        if self.started_at == 0 {
            return 0;
        }
        let end = if self.completed_at > 0 {
            self.completed_at
        } else {
            now
        };
        (end - self.started_at).max(0)
    }

    /// Instance cost so far, in USD
    pub fn cost(&self, now: i64) -> f64 {
        let hourly = self.droplet.as_ref().map_or(0.0, ResourceHandle::hourly_price);
        hourly * self.elapsed(now) as f64 / 3600.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::TimedOut).unwrap(),
            "\"timedout\""
        );
        let parsed: JobStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, JobStatus::Cancelled);
        assert_eq!("Running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_lifecycle_graph() {
        use JobStatus::*;
        assert!(Provisioning.can_transition_to(Running));
        assert!(Provisioning.can_transition_to(Cancelled));
        assert!(!Provisioning.can_transition_to(Completed));
        assert!(Running.can_transition_to(TimedOut));
        assert!(!Running.can_transition_to(Running));
        for terminal in [Completed, Failed, Cancelled, TimedOut] {
            assert!(terminal.is_terminal());
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_tombstone_is_never_serialized() {
        let json = serde_json::to_value(Job::tombstone(4)).unwrap();
        assert!(json.get("delete").is_none());
        assert!(json.get("Delete").is_none());
        assert!(json.get("droplet").is_none());
    }

    #[test]
    fn test_legacy_record() {
        let job: Job = serde_json::from_str(
            r#"{
                "name": "", "id": 3, "started_at": 10, "completed_at": 0, "updated_at": 12,
                "status": "running", "Delete": false,
                "droplet": {"Name": "cloudexec-alice", "ID": 99, "IP": "10.0.0.1", "Created": "2023-06-01T00:00:00Z"}
            }"#,
        )
        .unwrap();
        let handle = job.droplet.unwrap();
        assert_eq!(handle.id, 99);
        assert_eq!(handle.ip, "10.0.0.1");
        assert!(handle.size.is_none());
        assert!(!job.delete);
    }

    #[test]
    fn test_zero_droplet_is_unbound() {
        let job: Job = serde_json::from_str(
            r#"{"name": "x", "id": 1, "status": "provisioning",
                "droplet": {"Name": "", "ID": 0, "IP": "", "Created": ""}}"#,
        )
        .unwrap();
        assert!(job.droplet.is_none());
    }

    #[test]
    fn test_terminal_status_stamps_completion() {
        let job = Job::new(1, "build", 100);
        let running = job.with_status(JobStatus::Running, 110);
        assert_eq!(running.completed_at, 0);
        let done = running.with_status(JobStatus::Completed, 200);
        assert_eq!(done.completed_at, 200);
        assert_eq!(done.updated_at, 200);
        assert_eq!(done.elapsed(9999), 100);
    }

    #[test]
    fn test_cost_uses_hourly_price() {
        let mut job = Job::new(1, "fuzz", 0);
        job.started_at = 1;
        job.droplet = Some(ResourceHandle {
            id: 7,
            size: Some(InstanceSize {
                slug: "c-2".into(),
                price_hourly: 0.5,
                ..InstanceSize::default()
            }),
            ..ResourceHandle::default()
        });
        assert!((job.cost(7201) - 1.0).abs() < 1e-9);
    }
}
