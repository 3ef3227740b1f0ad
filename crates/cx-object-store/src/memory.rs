//! In-process backend
//!
//! Behaves like a single-part-upload S3 bucket: quoted md5 ETags, sorted
//! listings cut into pages, `Content-MD5` and `If-Match` enforcement.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::backend::{ListPage, ObjectBackend, PutReceipt, PutRequest, StoredObject};
use crate::digest;
use crate::error::{ObjectStoreError, Result};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct MemoryObject {
    body: Vec<u8>,
    etag: String,
    content_type: Option<String>,
}

#[derive(Debug, Default)]
struct Bucket {
    exists: bool,
    versioning: bool,
    objects: BTreeMap<String, MemoryObject>,
}

pub struct MemoryBackend {
    container: String,
    page_size: usize,
    bucket: RwLock<Bucket>,
}

impl MemoryBackend {
    /// A backend whose container already exists
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            page_size: DEFAULT_PAGE_SIZE,
            bucket: RwLock::new(Bucket {
                exists: true,
                ..Bucket::default()
            }),
        }
    }

    /// A backend whose container still has to be created
    pub fn without_container(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            page_size: DEFAULT_PAGE_SIZE,
            bucket: RwLock::new(Bucket::default()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn versioning_enabled(&self) -> bool {
        self.bucket.read().await.versioning
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.bucket
            .read()
            .await
            .objects
            .get(key)
            .and_then(|o| o.content_type.clone())
    }

    /// Current ETag of `key`, if present
    pub async fn etag(&self, key: &str) -> Option<String> {
        self.bucket
            .read()
            .await
            .objects
            .get(key)
            .map(|o| o.etag.clone())
    }

    /// Raw body of `key`, bypassing verification
    pub async fn body(&self, key: &str) -> Option<Vec<u8>> {
        self.bucket
            .read()
            .await
            .objects
            .get(key)
            .map(|o| o.body.clone())
    }

    pub async fn keys(&self) -> Vec<String> {
        self.bucket.read().await.objects.keys().cloned().collect()
    }

    async fn require_container(&self, operation: &'static str) -> Result<()> {
        if self.bucket.read().await.exists {
            Ok(())
        } else {
            Err(ObjectStoreError::transient(
                operation,
                &self.container,
                "NoSuchBucket",
            ))
        }
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn container(&self) -> &str {
        &self.container
    }

    async fn container_exists(&self) -> Result<bool> {
        Ok(self.bucket.read().await.exists)
    }

    async fn create_container(&self) -> Result<()> {
        self.bucket.write().await.exists = true;
        Ok(())
    }

    async fn enable_versioning(&self) -> Result<()> {
        self.require_container("put-bucket-versioning").await?;
        self.bucket.write().await.versioning = true;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<StoredObject> {
        self.require_container("get").await?;
        let bucket = self.bucket.read().await;
        let object = bucket
            .objects
            .get(key)
            .ok_or_else(|| ObjectStoreError::not_found(key))?;
        Ok(StoredObject {
            body: object.body.clone(),
            etag: Some(object.etag.clone()),
        })
    }

    async fn put_object(&self, request: PutRequest) -> Result<PutReceipt> {
        self.require_container("put").await?;

        if let Some(expected) = &request.content_md5 {
            if *expected != digest::content_md5(&request.body) {
                return Err(ObjectStoreError::transient(
                    "put",
                    &request.key,
                    "BadDigest: the Content-MD5 you specified did not match what we received",
                ));
            }
        }

        let mut bucket = self.bucket.write().await;

        if let Some(expected) = &request.if_match {
            let current = bucket.objects.get(&request.key).map(|o| o.etag.as_str());
            if current != Some(expected.as_str()) {
                return Err(ObjectStoreError::PreconditionFailed { key: request.key });
            }
        }

        let etag = digest::etag_for(&request.body);
        bucket.objects.insert(
            request.key,
            MemoryObject {
                body: request.body,
                etag: etag.clone(),
                content_type: request.content_type,
            },
        );
        Ok(PutReceipt { etag: Some(etag) })
    }

    async fn list_page(&self, prefix: &str, marker: Option<&str>) -> Result<ListPage> {
        self.require_container("list").await?;
        let bucket = self.bucket.read().await;

        let mut matching = bucket
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| marker.map_or(true, |m| key.as_str() > m));

        let keys: Vec<String> = matching.by_ref().take(self.page_size).cloned().collect();
        let truncated = matching.next().is_some();

        Ok(ListPage {
            next_marker: if truncated { keys.last().cloned() } else { None },
            keys,
        })
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.require_container("delete").await?;
        self.bucket.write().await.objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_if_match_is_enforced() {
        let backend = MemoryBackend::new("b");
        let first = backend
            .put_object(PutRequest {
                key: "k".into(),
                body: b"one".to_vec(),
                ..PutRequest::default()
            })
            .await
            .unwrap();

        let stale = backend
            .put_object(PutRequest {
                key: "k".into(),
                body: b"two".to_vec(),
                if_match: Some(digest::etag_for(b"zero")),
                ..PutRequest::default()
            })
            .await;
        assert!(matches!(stale, Err(ObjectStoreError::PreconditionFailed { .. })));

        backend
            .put_object(PutRequest {
                key: "k".into(),
                body: b"two".to_vec(),
                if_match: first.etag,
                ..PutRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(backend.body("k").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_bad_digest_is_rejected() {
        let backend = MemoryBackend::new("b");
        let result = backend
            .put_object(PutRequest {
                key: "k".into(),
                body: b"payload".to_vec(),
                content_md5: Some(digest::content_md5(b"other")),
                ..PutRequest::default()
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert!(backend.body("k").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_container() {
        let backend = MemoryBackend::without_container("b");
        assert!(!backend.container_exists().await.unwrap());
        assert!(backend.get_object("k").await.unwrap_err().is_transient());
    }
}
