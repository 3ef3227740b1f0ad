//! Per-user naming
//!
//! Every resource cloudexec creates is scoped to the user running it: one bucket,
//! one SSH key, and instances tagged with the owner and job id.

/// Prefix shared by every resource name
pub const NAME_PREFIX: &str = "cloudexec";

/// The user on whose behalf resources are created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    username: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Bucket holding the state document and job payloads.
    ///
    /// Bucket names only allow lowercase letters, digits and dashes.
    pub fn bucket_name(&self) -> String {
        format!("{}-{}", NAME_PREFIX, sanitize(&self.username))
    }

    /// Name under which the SSH public key is registered with the provider
    pub fn key_name(&self) -> String {
        format!("{}-{}", NAME_PREFIX, self.username)
    }

    /// Instance name for a job
    pub fn instance_name(&self, job_id: i64) -> String {
        format!("{}-{}-{}", NAME_PREFIX, sanitize(&self.username), job_id)
    }

    /// Tag carried by every instance this user owns
    pub fn owner_tag(&self) -> String {
        format!("Owner:{}", self.username)
    }

    /// Tags attached to the instance running `job_id`
    pub fn instance_tags(&self, job_id: i64) -> Vec<String> {
        vec![
            format!("Purpose:{}", NAME_PREFIX),
            self.owner_tag(),
            format!("Job:{}", job_id),
        ]
    }
}

fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_matches('-').to_string()
}
