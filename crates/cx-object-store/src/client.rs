//! Integrity-checked object store client
//!
//! The client is built once per invocation and handed to whoever needs it; it
//! holds no global state, so tests can swap in any [`ObjectBackend`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{ObjectBackend, PutRequest};
use crate::digest;
use crate::error::{ObjectStoreError, Result};
use crate::retry::RetryPolicy;

/// A read whose body matched the digest the backend reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedObject {
    pub body: Vec<u8>,
    pub etag: String,
}

pub struct ObjectStoreClient {
    backend: Arc<dyn ObjectBackend>,
    retry: RetryPolicy,
}

impl ObjectStoreClient {
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self {
            backend,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn container(&self) -> &str {
        self.backend.container()
    }

    /// Create the container when missing, then make sure versioning is on.
    ///
    /// Versioning is re-applied every time since a previous creation may have
    /// been interrupted. Returns whether the container was created.
    pub async fn ensure_container(&self) -> Result<bool> {
        let created = if self.backend.container_exists().await? {
            false
        } else {
            info!("Creating new {} bucket", self.container());
            self.backend.create_container().await?;
            true
        };
        self.backend.enable_versioning().await?;
        Ok(created)
    }

    /// Read `key`, verifying its md5 against the reported ETag
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        Ok(self.get_versioned(key).await?.body)
    }

    /// Read `key` and return the verified ETag alongside the bytes.
    ///
    /// A stale or damaged read (digest mismatch, missing ETag) and transient
    /// backend failures are retried up to the policy bound. `NotFound` is not.
    pub async fn get_versioned(&self, key: &str) -> Result<VerifiedObject> {
        let mut attempt = 1;
        loop {
            let failure = match self.backend.get_object(key).await {
                Ok(object) => {
                    let reported = object.etag.unwrap_or_default();
                    if digest::etag_matches(&reported, &object.body) {
                        debug!(key, attempt, bytes = object.body.len(), "Verified object read");
                        return Ok(VerifiedObject {
                            body: object.body,
                            etag: reported,
                        });
                    }
                    ObjectStoreError::Integrity {
                        key: key.to_string(),
                        attempts: attempt,
                        calculated: digest::md5_hex(&object.body),
                        reported,
                    }
                }
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            if self.retry.is_last(attempt) {
                return Err(failure);
            }

            warn!(key, attempt, error = %failure, "Object read failed, retrying");
            tokio::time::sleep(self.retry.delay_after(attempt)).await;
            attempt += 1;
        }
    }

    /// Overwrite `key` with `bytes`.
    ///
    /// An empty payload creates a directory-like placeholder instead of a file.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.put_conditional(key, bytes, None).await.map(|_| ())
    }

    /// Overwrite `key` only while its current ETag equals `if_match`.
    ///
    /// Returns the ETag of the new object when the backend reports one.
    pub async fn put_conditional(
        &self,
        key: &str,
        bytes: &[u8],
        if_match: Option<&str>,
    ) -> Result<Option<String>> {
        let request = if bytes.is_empty() {
            PutRequest {
                key: key.to_string(),
                if_match: if_match.map(str::to_string),
                ..PutRequest::default()
            }
        } else {
            PutRequest {
                key: key.to_string(),
                body: bytes.to_vec(),
                content_md5: Some(digest::content_md5(bytes)),
                content_type: Some(digest::content_type_for(key).to_string()),
                if_match: if_match.map(str::to_string),
            }
        };

        debug!(key, bytes = bytes.len(), conditional = if_match.is_some(), "Writing object");
        let receipt = self.backend.put_object(request).await?;
        Ok(receipt.etag)
    }

    /// Every key under `prefix`, following continuation markers to the end
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = self.backend.list_page(prefix, marker.as_deref()).await?;
            keys.extend(page.keys);

            match page.next_marker {
                // a marker that does not advance would loop forever
                Some(next) if marker.as_deref() != Some(next.as_str()) => marker = Some(next),
                _ => break,
            }
        }

        debug!(prefix, count = keys.len(), "Listed objects");
        Ok(keys)
    }

    /// Whether any object exists under `key`
    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(!self.list(key).await?.is_empty())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        debug!(key, "Deleting object");
        self.backend.delete_object(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn client() -> (Arc<MemoryBackend>, ObjectStoreClient) {
        let backend = Arc::new(MemoryBackend::new("cloudexec-test"));
        let client = ObjectStoreClient::new(backend.clone());
        (backend, client)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_, client) = client();
        client.put("state/state.json", b"{}").await.unwrap();
        assert_eq!(client.get("state/state.json").await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let (_, client) = client();
        let err = client.get("state/state.json").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_empty_put_creates_placeholder() {
        let (backend, client) = client();
        client.put("state/", b"").await.unwrap();
        assert!(client.exists("state/").await.unwrap());
        assert_eq!(backend.content_type("state/").await, None);
    }

    #[tokio::test]
    async fn test_json_content_type() {
        let (backend, client) = client();
        client.put("state/state.json", b"{}").await.unwrap();
        assert_eq!(
            backend.content_type("state/state.json").await.as_deref(),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn test_list_follows_pagination() {
        let backend = Arc::new(MemoryBackend::new("cloudexec-test").with_page_size(2));
        let client = ObjectStoreClient::new(backend);
        for i in 0..5 {
            client
                .put(&format!("job-1/output/file-{i}"), b"data")
                .await
                .unwrap();
        }
        client.put("job-2/input.tar.gz", b"data").await.unwrap();

        let keys = client.list("job-1/").await.unwrap();
        assert_eq!(keys.len(), 5);
        assert_eq!(keys[0], "job-1/output/file-0");
        assert_eq!(keys[4], "job-1/output/file-4");
    }

    #[tokio::test]
    async fn test_exists_is_prefix_based() {
        let (_, client) = client();
        client.put("state/state.json", b"{}").await.unwrap();
        assert!(client.exists("state/").await.unwrap());
        assert!(client.exists("state/state.json").await.unwrap());
        assert!(!client.exists("job-1/").await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_container() {
        let backend = Arc::new(MemoryBackend::without_container("cloudexec-new"));
        let client = ObjectStoreClient::new(backend.clone());

        assert!(client.ensure_container().await.unwrap());
        assert!(!client.ensure_container().await.unwrap());
        assert!(backend.versioning_enabled().await);
    }
}
