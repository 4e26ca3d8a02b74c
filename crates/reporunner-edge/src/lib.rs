//! The collaborator surface named in §2: "Translates external calls to two
//! producer events (`RunRequested`, `RunStopRequested`) and one cached-read
//! (`StatusByRunId`). Also streams logs by querying the document store."
//!
//! The HTTP/RPC transport that calls into this crate is out of scope (§1) —
//! there's no server here, just the three operations a transport layer
//! would wire to request handlers. `EdgeAdapter` depends on exactly the
//! three collaborators §2 names: the event-log producer, the cache, and the
//! document store.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use reporunner_cache::Cache;
use reporunner_eventlog::Producer;
use reporunner_store::DocumentStore;
use reporunner_types::{Error, Event, LogLine, LogSource, Mode, Result, RunId, StatusProjection};
use tokio::sync::Mutex;

/// Caller-supplied fields for a new run request. `run_id` is minted by the
/// transport layer (e.g. from the client's idempotency key) — the edge
/// never generates identities, it only forwards them.
pub struct RunRequest {
    pub run_id: RunId,
    pub repo: String,
    pub branch: String,
    pub mode: Mode,
    pub compose_path: Option<String>,
    pub primary_service: Option<String>,
}

/// The producer seam, abstracted the same `Pin<Box<dyn Future>>` way as
/// `Cache` and `EventHandler` so tests can substitute a fake without a live
/// broker connection.
pub trait Publisher: Send + Sync {
    fn publish<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

impl Publisher for Mutex<Producer> {
    fn publish<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.lock().await.publish(event).await?;
            Ok(())
        })
    }
}

pub struct EdgeAdapter {
    producer: Box<dyn Publisher>,
    cache: Arc<dyn Cache>,
    store: Arc<dyn DocumentStore>,
}

impl EdgeAdapter {
    pub fn new(producer: Producer, cache: Arc<dyn Cache>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            producer: Box::new(Mutex::new(producer)),
            cache,
            store,
        }
    }

    fn with_publisher(producer: Box<dyn Publisher>, cache: Arc<dyn Cache>, store: Arc<dyn DocumentStore>) -> Self {
        Self { producer, cache, store }
    }

    /// Emit `RunRequested`. The Coordinator owns creation of the `Run`
    /// document; this call only places the request on the log.
    pub async fn submit_run(&self, request: RunRequest) -> Result<()> {
        let event = Event::RunRequested {
            run_id: request.run_id,
            repo: request.repo,
            branch: request.branch,
            mode: request.mode,
            compose_path: request.compose_path,
            primary_service: request.primary_service,
        };
        self.producer.publish(&event).await
    }

    /// Emit `RunStopRequested`. `tenant` is optional — most callers don't
    /// know the tenant name, only the `run_id` the client holds.
    pub async fn request_stop(&self, run_id: RunId, tenant: Option<String>) -> Result<()> {
        let event = Event::RunStopRequested {
            run_id,
            tenant,
            requested_at: Utc::now(),
        };
        self.producer.publish(&event).await
    }

    /// `StatusByRunId` — the one cached-read §2 names. Never falls back to
    /// the document store: a cache miss means the Coordinator hasn't
    /// projected this run yet, which the caller surfaces as "not found",
    /// not as a document-store round-trip.
    pub async fn status_by_run_id(&self, run_id: &RunId) -> Result<Option<StatusProjection>> {
        self.cache.get_status(run_id).await
    }

    /// Stream log lines for a run, optionally filtered to a phase and
    /// service, ordered ascending by timestamp — the document-store query
    /// backing a client's log tail.
    pub async fn tail_logs(
        &self,
        run_id: RunId,
        source: Option<LogSource>,
        service_name: Option<String>,
    ) -> Result<Vec<LogLine>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list_log_lines(&run_id, source, service_name.as_deref()))
            .await
            .map_err(|e| Error::TransientDependency(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reporunner_store::{SqliteDocumentStore, SqliteStoreConfig};
    use std::sync::Mutex as StdMutex;

    struct FakeCache {
        last: StdMutex<Option<StatusProjection>>,
    }

    impl FakeCache {
        fn new() -> Self {
            Self { last: StdMutex::new(None) }
        }

        fn seed(&self, projection: StatusProjection) {
            *self.last.lock().unwrap() = Some(projection);
        }
    }

    impl Cache for FakeCache {
        fn get_status(&self, _run_id: &RunId) -> Pin<Box<dyn Future<Output = Result<Option<StatusProjection>>> + Send + '_>> {
            Box::pin(async move { Ok(self.last.lock().unwrap().clone()) })
        }

        fn put_status(&self, projection: &StatusProjection) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let projection = projection.clone();
            Box::pin(async move {
                *self.last.lock().unwrap() = Some(projection);
                Ok(())
            })
        }

        fn delete_status(&self, _run_id: &RunId) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                *self.last.lock().unwrap() = None;
                Ok(())
            })
        }
    }

    struct FakePublisher {
        published: StdMutex<Vec<Event>>,
    }

    impl FakePublisher {
        fn new() -> Self {
            Self { published: StdMutex::new(Vec::new()) }
        }
    }

    impl Publisher for FakePublisher {
        fn publish<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async move {
                self.published.lock().unwrap().push(event.clone());
                Ok(())
            })
        }
    }

    fn store() -> Arc<dyn DocumentStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::new(SqliteStoreConfig {
            path: dir.path().join("test.sqlite3"),
            busy_timeout_ms: 5_000,
        })
        .unwrap();
        std::mem::forget(dir);
        Arc::new(store)
    }

    fn adapter(publisher: FakePublisher, cache: Arc<dyn Cache>) -> (EdgeAdapter, Arc<dyn DocumentStore>) {
        let store = store();
        let adapter = EdgeAdapter::with_publisher(Box::new(publisher), cache, store.clone());
        (adapter, store)
    }

    #[tokio::test]
    async fn submit_run_publishes_run_requested() {
        let (adapter, _store) = adapter(FakePublisher::new(), Arc::new(FakeCache::new()));
        adapter
            .submit_run(RunRequest {
                run_id: "r1".to_string(),
                repo: "https://example.invalid/x.git".to_string(),
                branch: "main".to_string(),
                mode: Mode::SingleImage,
                compose_path: None,
                primary_service: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn request_stop_publishes_run_stop_requested() {
        let (adapter, _store) = adapter(FakePublisher::new(), Arc::new(FakeCache::new()));
        adapter.request_stop("r1".to_string(), Some("run-r1".to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn status_by_run_id_reflects_cache_miss_as_none() {
        let (adapter, _store) = adapter(FakePublisher::new(), Arc::new(FakeCache::new()));
        assert!(adapter.status_by_run_id(&"missing".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_by_run_id_surfaces_seeded_projection() {
        let fake = Arc::new(FakeCache::new());
        fake.seed(StatusProjection {
            run_id: "r1".to_string(),
            status: reporunner_types::Status::Running,
            preview_url: Some("http://localhost:8080".to_string()),
            mode: Mode::SingleImage,
            primary_service: None,
            error: None,
            progress: "running".to_string(),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
        });
        let (adapter, _store) = adapter(FakePublisher::new(), fake);
        let projection = adapter.status_by_run_id(&"r1".to_string()).await.unwrap().unwrap();
        assert_eq!(projection.status, reporunner_types::Status::Running);
    }

    #[tokio::test]
    async fn tail_logs_returns_appended_lines_in_order() {
        let (adapter, backing) = adapter(FakePublisher::new(), Arc::new(FakeCache::new()));

        let t0 = Utc::now();
        backing
            .append_log_line(&LogLine {
                run_id: "r1".to_string(),
                source: LogSource::Run,
                service_name: Some("web".to_string()),
                line: "starting".to_string(),
                timestamp: t0,
            })
            .unwrap();
        backing
            .append_log_line(&LogLine {
                run_id: "r1".to_string(),
                source: LogSource::Run,
                service_name: Some("web".to_string()),
                line: "ready".to_string(),
                timestamp: t0 + chrono::Duration::seconds(1),
            })
            .unwrap();

        let lines = adapter
            .tail_logs("r1".to_string(), Some(LogSource::Run), Some("web".to_string()))
            .await
            .unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line, "starting");
        assert_eq!(lines[1].line, "ready");
    }
}
