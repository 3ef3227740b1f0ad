//! Compute provider seam

use async_trait::async_trait;
use cx_state_store::ResourceHandle;

use crate::error::Result;

/// Everything needed to boot one job's instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    pub region: String,
    /// Provider size slug, e.g. `c-2`
    pub size: String,
    /// cloud-init script run on first boot
    pub user_data: String,
    pub tags: Vec<String>,
    /// Name under which `public_key` is registered with the provider
    pub key_name: String,
    pub public_key: String,
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Verify the API credentials, returning the account identifier
    async fn check_auth(&self) -> Result<String>;

    /// Boot an instance and wait until it has a public address
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<ResourceHandle>;

    async fn list_instances_by_tag(&self, tag: &str) -> Result<Vec<ResourceHandle>>;

    /// Destroy an instance. An instance that is already gone is not an error.
    async fn delete_instance(&self, id: i64) -> Result<()>;
}
