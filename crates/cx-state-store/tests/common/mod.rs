//! Backends that misbehave on purpose

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cx_object_store::{
    ListPage, MemoryBackend, ObjectBackend, ObjectStoreClient, ObjectStoreError, PutReceipt,
    PutRequest, Result, StoredObject,
};
use cx_state_store::{JobRegistry, StateStore};

pub fn client(backend: Arc<dyn ObjectBackend>) -> Arc<ObjectStoreClient> {
    Arc::new(ObjectStoreClient::new(backend))
}

/// A bucket holding an initialized, empty state document
pub async fn initialized() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new("cloudexec-test"));
    StateStore::new(client(backend.clone()))
        .initialize()
        .await
        .unwrap();
    backend
}

pub fn registry(backend: Arc<dyn ObjectBackend>) -> JobRegistry {
    JobRegistry::new(StateStore::new(client(backend)))
}

/// Serves a pinned snapshot on the next read, then passes through.
///
/// Models a writer whose read was answered before another writer's update
/// became visible.
pub struct StaleRead {
    inner: Arc<MemoryBackend>,
    pinned: Mutex<Option<StoredObject>>,
}

impl StaleRead {
    pub fn new(inner: Arc<MemoryBackend>, snapshot: StoredObject) -> Self {
        Self {
            inner,
            pinned: Mutex::new(Some(snapshot)),
        }
    }
}

/// Fails the first `failures` puts with a transient error
pub struct FailingPuts {
    inner: Arc<MemoryBackend>,
    failures: usize,
    puts: AtomicUsize,
}

impl FailingPuts {
    pub fn new(inner: Arc<MemoryBackend>, failures: usize) -> Self {
        Self {
            inner,
            failures,
            puts: AtomicUsize::new(0),
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

/// Stores the first `lost` puts but reports each as a transient failure,
/// as when the response is dropped after the write landed
pub struct LostAck {
    inner: Arc<MemoryBackend>,
    lost: usize,
    puts: AtomicUsize,
}

impl LostAck {
    pub fn new(inner: Arc<MemoryBackend>, lost: usize) -> Self {
        Self {
            inner,
            lost,
            puts: AtomicUsize::new(0),
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

macro_rules! delegate_backend {
    ($wrapper:ty, get = |$this:ident, $key:ident| $get:expr, put = |$pthis:ident, $request:ident| $put:expr) => {
        #[async_trait]
        impl ObjectBackend for $wrapper {
            fn container(&self) -> &str {
                self.inner.container()
            }

            async fn container_exists(&self) -> Result<bool> {
                self.inner.container_exists().await
            }

            async fn create_container(&self) -> Result<()> {
                self.inner.create_container().await
            }

            async fn enable_versioning(&self) -> Result<()> {
                self.inner.enable_versioning().await
            }

            async fn get_object(&self, $key: &str) -> Result<StoredObject> {
                let $this = self;
                $get
            }

            async fn put_object(&self, $request: PutRequest) -> Result<PutReceipt> {
                let $pthis = self;
                $put
            }

            async fn list_page(&self, prefix: &str, marker: Option<&str>) -> Result<ListPage> {
                self.inner.list_page(prefix, marker).await
            }

            async fn delete_object(&self, key: &str) -> Result<()> {
                self.inner.delete_object(key).await
            }
        }
    };
}

delegate_backend!(
    StaleRead,
    get = |this, key| {
        let pinned = this.pinned.lock().unwrap().take();
        match pinned {
            Some(snapshot) => Ok(snapshot),
            None => this.inner.get_object(key).await,
        }
    },
    put = |this, request| this.inner.put_object(request).await
);

delegate_backend!(
    FailingPuts,
    get = |this, key| this.inner.get_object(key).await,
    put = |this, request| {
        let put = this.puts.fetch_add(1, Ordering::SeqCst);
        if put < this.failures {
            return Err(ObjectStoreError::transient("put", request.key, "connection reset"));
        }
        this.inner.put_object(request).await
    }
);

delegate_backend!(
    LostAck,
    get = |this, key| this.inner.get_object(key).await,
    put = |this, request| {
        let put = this.puts.fetch_add(1, Ordering::SeqCst);
        let key = request.key.clone();
        let receipt = this.inner.put_object(request).await?;
        if put < this.lost {
            return Err(ObjectStoreError::transient("put", key, "response lost"));
        }
        Ok(receipt)
    }
);
