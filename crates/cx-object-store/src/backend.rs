//! Storage backend seam
//!
//! A backend addresses a single container (bucket) chosen at construction time.
//! It reports what the service says and nothing more: digest checks, retries and
//! pagination live in [`crate::ObjectStoreClient`].

use async_trait::async_trait;

use crate::error::Result;

/// Bytes returned by a read together with the digest the backend reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    /// Entity tag as sent by the service, usually a quoted md5 hex digest
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutRequest {
    pub key: String,
    pub body: Vec<u8>,
    /// Base64 md5 of `body`, checked by the service on receipt
    pub content_md5: Option<String>,
    pub content_type: Option<String>,
    /// Only write if the current object's ETag equals this value
    pub if_match: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutReceipt {
    pub etag: Option<String>,
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Marker to pass for the next page; `None` once the listing is exhausted
    pub next_marker: Option<String>,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Human readable container name, used in log lines
    fn container(&self) -> &str;

    async fn container_exists(&self) -> Result<bool>;

    async fn create_container(&self) -> Result<()>;

    async fn enable_versioning(&self) -> Result<()>;

    async fn get_object(&self, key: &str) -> Result<StoredObject>;

    async fn put_object(&self, request: PutRequest) -> Result<PutReceipt>;

    async fn list_page(&self, prefix: &str, marker: Option<&str>) -> Result<ListPage>;

    async fn delete_object(&self, key: &str) -> Result<()>;
}
