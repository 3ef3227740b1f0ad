mod common;

use std::sync::Arc;

use common::{client, initialized, FailingPuts, LostAck, StaleRead};
use cx_core::ConsistencyMode;
use cx_object_store::{MemoryBackend, ObjectBackend, ObjectStoreError};
use cx_state_store::{
    Job, JobRegistry, JobStatus, State, StateStore, StateStoreError, NO_NAME, STATE_DIR, STATE_KEY,
};

async fn stored_document(backend: &MemoryBackend) -> serde_json::Value {
    serde_json::from_slice(&backend.body(STATE_KEY).await.unwrap()).unwrap()
}

#[tokio::test]
async fn test_initialize_bootstraps_once() {
    let backend = Arc::new(MemoryBackend::new("cloudexec-test"));
    let store = StateStore::new(client(backend.clone()));

    assert!(store.initialize().await.unwrap());
    assert_eq!(backend.body(STATE_DIR).await.unwrap(), b"");
    assert_eq!(backend.body(STATE_KEY).await.unwrap(), b"{}");

    store
        .merge_and_save(&State::single(Job::new(1, "kept", 1)))
        .await
        .unwrap();
    assert!(!store.initialize().await.unwrap());
    assert_eq!(store.get_state().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_uninitialized_bucket_is_not_found() {
    let backend = Arc::new(MemoryBackend::new("cloudexec-test"));
    let store = StateStore::new(client(backend));

    let err = store.get_state().await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_corrupt_document_is_schema_error() {
    let backend = initialized().await;
    let store = StateStore::new(client(backend.clone()));
    store.client().put(STATE_KEY, b"{\"jobs\": 7}").await.unwrap();

    assert!(matches!(
        store.get_state().await,
        Err(StateStoreError::Schema(_))
    ));

    // no repair is attempted
    let err = store
        .merge_and_save(&State::single(Job::new(1, "x", 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, StateStoreError::Schema(_)));
    assert_eq!(backend.body(STATE_KEY).await.unwrap(), b"{\"jobs\": 7}");
}

#[tokio::test]
async fn test_duplicate_ids_are_schema_error() {
    let backend = initialized().await;
    let store = StateStore::new(client(backend));
    store
        .client()
        .put(
            STATE_KEY,
            br#"{"jobs":[{"id":1,"status":"running"},{"id":1,"status":"failed"}]}"#,
        )
        .await
        .unwrap();

    assert!(matches!(
        store.get_state().await,
        Err(StateStoreError::Schema(_))
    ));
}

#[tokio::test]
async fn test_legacy_document_loads() {
    let backend = initialized().await;
    let store = StateStore::new(client(backend.clone()));
    store
        .client()
        .put(
            STATE_KEY,
            br#"{"jobs":[
                {"name":"","id":1,"started_at":1,"completed_at":0,"updated_at":1,"status":"provisioning","Delete":false,
                 "droplet":{"Name":"","ID":0,"IP":"","Created":""}},
                {"name":"fuzz","id":2,"started_at":5,"completed_at":0,"updated_at":6,"status":"running","Delete":false,
                 "droplet":{"Name":"cloudexec-alice","ID":321,"IP":"10.1.2.3","Created":"2023-06-01T12:00:00Z"}}
            ]}"#,
        )
        .await
        .unwrap();

    let state = store.get_state().await.unwrap();
    assert_eq!(state.len(), 2);
    assert!(state.get_job(1).unwrap().droplet.is_none());
    assert_eq!(state.get_job(2).unwrap().droplet.as_ref().unwrap().id, 321);

    let null_jobs = br#"{"jobs":null}"#;
    store.client().put(STATE_KEY, null_jobs).await.unwrap();
    assert!(store.get_state().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_placeholder_name_is_not_persisted() {
    let backend = initialized().await;
    let store = StateStore::new(client(backend.clone()));

    store
        .merge_and_save(&State::single(Job::new(1, "", 10)))
        .await
        .unwrap();
    store
        .merge_and_save(&State::single(Job::new(2, "named", 11)))
        .await
        .unwrap();

    let shown = store.get_state().await.unwrap();
    assert_eq!(shown.get_job(1).unwrap().name, NO_NAME);

    let document = stored_document(&backend).await;
    assert_eq!(document["jobs"][0]["name"], "");
    assert_eq!(document["jobs"][1]["name"], "named");
}

#[tokio::test]
async fn test_tombstones_never_persist() {
    let backend = initialized().await;
    let store = StateStore::new(client(backend.clone()));

    store
        .merge_and_save(&State::single(Job::new(1, "a", 1)))
        .await
        .unwrap();
    store
        .merge_and_save(&State::single(Job::tombstone(1)))
        .await
        .unwrap();
    // tombstone for an id that never existed
    let merged = store
        .merge_and_save(&State::single(Job::tombstone(99)))
        .await
        .unwrap();

    assert!(merged.is_empty());
    let raw = String::from_utf8(backend.body(STATE_KEY).await.unwrap()).unwrap();
    assert_eq!(raw, r#"{"jobs":[]}"#);
    assert!(!raw.contains("delete"));
}

#[tokio::test]
async fn test_same_delta_twice_is_idempotent() {
    let backend = initialized().await;
    let store = StateStore::new(client(backend.clone()));
    store
        .merge_and_save(&State::single(Job::new(1, "base", 1)))
        .await
        .unwrap();

    let delta = State::single(Job::new(2, "again", 2));
    let once = store.merge_and_save(&delta).await.unwrap();
    let twice = store.merge_and_save(&delta).await.unwrap();

    assert_eq!(once, twice);
    assert_eq!(twice.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_write_survives_two_transient_failures() {
    let inner = initialized().await;
    let flaky = Arc::new(FailingPuts::new(inner.clone(), 2));
    let store = StateStore::new(client(flaky.clone()));

    store
        .merge_and_save(&State::single(Job::new(1, "a", 1)))
        .await
        .unwrap();

    assert_eq!(flaky.puts(), 3);
    assert_eq!(stored_document(&inner).await["jobs"][0]["id"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_write_gives_up_after_three_attempts() {
    let inner = initialized().await;
    let flaky = Arc::new(FailingPuts::new(inner.clone(), 3));
    let store = StateStore::new(client(flaky.clone()));

    let err = store
        .merge_and_save(&State::single(Job::new(1, "a", 1)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StateStoreError::ObjectStore(ObjectStoreError::Transient { .. })
    ));
    assert_eq!(flaky.puts(), 3);
    assert_eq!(inner.body(STATE_KEY).await.unwrap(), b"{}");
}

/// Writer A adds a job. Writer B read the document before A's write was
/// visible and then adds its own.
async fn race(consistency: ConsistencyMode) -> (Arc<MemoryBackend>, State) {
    let shared = initialized().await;
    let base = shared.get_object(STATE_KEY).await.unwrap();

    let writer_a = JobRegistry::new(StateStore::new(client(shared.clone())));
    writer_a.create_job("from-a").await.unwrap();

    let stale = Arc::new(StaleRead::new(shared.clone(), base));
    let writer_b =
        JobRegistry::new(StateStore::new(client(stale)).with_consistency(consistency));
    writer_b.create_job("from-b").await.unwrap();

    let state = writer_a.state().await.unwrap();
    (shared, state)
}

#[tokio::test]
async fn test_concurrent_writers_lose_an_update() {
    let (_, state) = race(ConsistencyMode::LastWriterWins).await;

    assert_eq!(state.len(), 1);
    let survivor = state.latest_job().unwrap();
    assert_eq!(survivor.name, "from-b");
    assert_eq!(survivor.id, 1);
}

#[tokio::test]
async fn test_concurrent_writer_drops_distinct_job() {
    let shared = initialized().await;
    let base = shared.get_object(STATE_KEY).await.unwrap();

    StateStore::new(client(shared.clone()))
        .merge_and_save(&State::single(Job::new(1, "from-a", 1)))
        .await
        .unwrap();

    let stale = Arc::new(StaleRead::new(shared.clone(), base));
    StateStore::new(client(stale))
        .merge_and_save(&State::single(Job::new(2, "from-b", 2)))
        .await
        .unwrap();

    let state = StateStore::new(client(shared)).get_state().await.unwrap();
    let ids: Vec<i64> = state.jobs().iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![2]);
}

#[tokio::test]
async fn test_optimistic_writers_both_survive() {
    let (_, state) = race(ConsistencyMode::Optimistic).await;

    let names: Vec<_> = state.jobs().iter().map(|j| (j.id, j.name.as_str())).collect();
    assert_eq!(names, vec![(1, "from-a"), (2, "from-b")]);
}

#[tokio::test]
async fn test_optimistic_conflict_after_replays() {
    // a backend that answers every read with the same stale snapshot
    struct AlwaysStale {
        inner: Arc<MemoryBackend>,
        snapshot: cx_object_store::StoredObject,
    }

    #[async_trait::async_trait]
    impl ObjectBackend for AlwaysStale {
        fn container(&self) -> &str {
            self.inner.container()
        }
        async fn container_exists(&self) -> cx_object_store::Result<bool> {
            Ok(true)
        }
        async fn create_container(&self) -> cx_object_store::Result<()> {
            Ok(())
        }
        async fn enable_versioning(&self) -> cx_object_store::Result<()> {
            Ok(())
        }
        async fn get_object(&self, _key: &str) -> cx_object_store::Result<cx_object_store::StoredObject> {
            Ok(self.snapshot.clone())
        }
        async fn put_object(
            &self,
            request: cx_object_store::PutRequest,
        ) -> cx_object_store::Result<cx_object_store::PutReceipt> {
            self.inner.put_object(request).await
        }
        async fn list_page(
            &self,
            prefix: &str,
            marker: Option<&str>,
        ) -> cx_object_store::Result<cx_object_store::ListPage> {
            self.inner.list_page(prefix, marker).await
        }
        async fn delete_object(&self, key: &str) -> cx_object_store::Result<()> {
            self.inner.delete_object(key).await
        }
    }

    let shared = initialized().await;
    let snapshot = shared.get_object(STATE_KEY).await.unwrap();
    StateStore::new(client(shared.clone()))
        .merge_and_save(&State::single(Job::new(1, "moved on", 1)))
        .await
        .unwrap();

    let store = StateStore::new(client(Arc::new(AlwaysStale {
        inner: shared.clone(),
        snapshot,
    })))
    .with_consistency(ConsistencyMode::Optimistic);

    let mut builds = 0;
    let err = store
        .update_with(|_| {
            builds += 1;
            Ok(State::single(Job::new(1, "never written", 2)))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, StateStoreError::Conflict { attempts: 3 }));
    assert_eq!(builds, 3);
    assert_eq!(stored_document(&shared).await["jobs"][0]["name"], "moved on");
}

#[tokio::test]
async fn test_failed_delta_build_writes_nothing() {
    let backend = initialized().await;
    let store = StateStore::new(client(backend.clone()));

    let err = store
        .update_with(|_| Err(StateStoreError::JobNotFound(5)))
        .await
        .unwrap_err();

    assert!(matches!(err, StateStoreError::JobNotFound(5)));
    assert_eq!(backend.body(STATE_KEY).await.unwrap(), b"{}");
}

#[tokio::test]
async fn test_status_round_trips_through_document() {
    let backend = initialized().await;
    let store = StateStore::new(client(backend.clone()));
    let mut job = Job::new(1, "t", 1);
    job.status = JobStatus::TimedOut;
    store.merge_and_save(&State::single(job)).await.unwrap();

    assert_eq!(stored_document(&backend).await["jobs"][0]["status"], "timedout");
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_write_with_lost_ack_records_once() {
    let inner = initialized().await;
    let lossy = Arc::new(LostAck::new(inner.clone(), 1));
    let registry = JobRegistry::new(
        StateStore::new(client(lossy.clone())).with_consistency(ConsistencyMode::Optimistic),
    );

    let job = registry.create_job("once").await.unwrap();

    assert_eq!(job.id, 1);
    assert_eq!(lossy.puts(), 2);
    let jobs: Vec<(i64, String)> = registry
        .state()
        .await
        .unwrap()
        .jobs()
        .iter()
        .map(|j| (j.id, j.name.clone()))
        .collect();
    assert_eq!(jobs, vec![(1, "once".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_last_writer_wins_with_lost_ack_records_once() {
    let inner = initialized().await;
    let lossy = Arc::new(LostAck::new(inner.clone(), 1));
    let registry = JobRegistry::new(StateStore::new(client(lossy.clone())));

    let job = registry.create_job("once").await.unwrap();

    assert_eq!(job.id, 1);
    assert_eq!(registry.state().await.unwrap().len(), 1);
}
