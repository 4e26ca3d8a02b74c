//! Single responsibility: own the `Run` document and its status projection
//! (§4.2). Consumes every lifecycle event; never produces one.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use reporunner_cache::Cache;
use reporunner_eventlog::{EventHandler, HandlerOutcome};
use reporunner_store::DocumentStore;
use reporunner_types::{Error, Event, Mode, Result, Run, Status, StatusProjection};

pub struct Coordinator {
    store: Arc<dyn DocumentStore>,
    cache: Arc<dyn Cache>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<dyn Cache>) -> Self {
        Self { store, cache }
    }

    async fn handle(&self, event: Event) -> Result<()> {
        match event {
            Event::RunRequested {
                run_id,
                repo,
                branch,
                mode,
                compose_path,
                primary_service,
            } => self.on_run_requested(run_id, repo, branch, mode, compose_path, primary_service).await,
            Event::BuildProgress {
                run_id,
                current,
                total,
                service_name,
                ..
            } => self.on_build_progress(run_id, current, total, service_name).await,
            Event::BuildSucceeded {
                run_id,
                payload,
                completed_at: _,
                logs_ref,
                ..
            } => self.on_build_succeeded(run_id, payload, logs_ref).await,
            Event::BuildFailed {
                run_id,
                error,
                failed_at,
                logs_ref,
                suggested_fixes: _,
            } => self.on_build_failed(run_id, error, failed_at, logs_ref).await,
            Event::RunSucceeded {
                run_id,
                preview_url,
                tenant,
                started_at,
            } => self.on_run_succeeded(run_id, preview_url, tenant, started_at).await,
            Event::RunFailed { run_id, error, failed_at } => {
                self.on_run_failed(run_id, error, failed_at).await
            }
            Event::RunStopRequested { run_id, .. } => self.on_stop_requested(run_id).await,
        }
    }

    async fn load_run(&self, run_id: &str) -> Result<Run> {
        let store = self.store.clone();
        let run_id = run_id.to_string();
        let run = tokio::task::spawn_blocking(move || store.get_run(&run_id))
            .await
            .map_err(|e| Error::TransientDependency(e.to_string()))??;
        run.ok_or_else(|| Error::TransientDependency("run not yet visible".to_string()))
    }

    async fn save_run(&self, run: Run) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.put_run(&run))
            .await
            .map_err(|e| Error::TransientDependency(e.to_string()))??;
        Ok(())
    }

    async fn project(&self, run: &Run, progress: &str) {
        let projection = StatusProjection {
            run_id: run.run_id.clone(),
            status: run.status,
            preview_url: run.preview_url.clone(),
            mode: run.mode,
            primary_service: run.primary_service.clone(),
            error: run.error.clone(),
            progress: progress.to_string(),
            created_at: run.created_at,
            started_at: run.started_at,
            completed_at: run.completed_at,
        };
        if let Err(e) = self.cache.put_status(&projection).await {
            tracing::warn!(run_id = %run.run_id, error = %e, "projection cache write failed, document remains authoritative");
        }
    }

    async fn on_run_requested(
        &self,
        run_id: String,
        repo: String,
        branch: String,
        mode: Mode,
        compose_path: Option<String>,
        primary_service: Option<String>,
    ) -> Result<()> {
        let store = self.store.clone();
        let existing_id = run_id.clone();
        let existing = tokio::task::spawn_blocking(move || store.get_run(&existing_id))
            .await
            .map_err(|e| Error::TransientDependency(e.to_string()))??;
        if existing.is_some() {
            // Idempotent: RunRequested redelivered for a run the Coordinator already created.
            return Ok(());
        }

        let run = Run::new_queued(run_id, repo, branch, mode, compose_path, primary_service, Utc::now());
        self.project(&run, "queued").await;
        self.save_run(run).await
    }

    async fn on_build_progress(&self, run_id: String, current: u32, total: u32, service_name: String) -> Result<()> {
        let mut run = self.load_run(&run_id).await?;
        let progress = format!("{current}/{total} Building {service_name}");
        // Silently dropped if a terminal/later status already landed — the
        // document isn't touched either way, only the projection, and only
        // when the run hasn't already moved past Building.
        if run.status.rank_position() > Status::Building.rank_position() {
            return Ok(());
        }
        run.status = Status::Building;
        self.project(&run, &progress).await;
        Ok(())
    }

    async fn on_build_succeeded(&self, run_id: String, payload: reporunner_types::RunPayload, logs_ref: Option<String>) -> Result<()> {
        let mut run = self.load_run(&run_id).await?;
        run.advance_status(Status::Deploying);
        run.payload = Some(payload);
        run.logs_ref = logs_ref;
        self.project(&run, "deploying").await;
        self.save_run(run).await
    }

    async fn on_build_failed(&self, run_id: String, error: String, failed_at: chrono::DateTime<Utc>, logs_ref: Option<String>) -> Result<()> {
        let mut run = self.load_run(&run_id).await?;
        run.advance_status(Status::Failed);
        run.error = Some(error);
        run.completed_at = Some(failed_at);
        run.logs_ref = logs_ref.or(run.logs_ref);
        self.project(&run, "failed").await;
        self.save_run(run).await
    }

    async fn on_run_succeeded(&self, run_id: String, preview_url: String, tenant: String, started_at: chrono::DateTime<Utc>) -> Result<()> {
        let mut run = self.load_run(&run_id).await?;
        run.advance_status(Status::Running);
        run.tenant = Some(tenant);
        run.preview_url = Some(preview_url);
        run.started_at = Some(started_at);
        self.project(&run, "running").await;
        self.save_run(run).await
    }

    async fn on_run_failed(&self, run_id: String, error: String, failed_at: chrono::DateTime<Utc>) -> Result<()> {
        let mut run = self.load_run(&run_id).await?;
        run.advance_status(Status::Failed);
        run.error = Some(error);
        run.completed_at = Some(failed_at);
        self.project(&run, "failed").await;
        self.save_run(run).await
    }

    async fn on_stop_requested(&self, run_id: String) -> Result<()> {
        // Single writer path for any terminal status: the document is
        // updated here, immediately, so a BuildSucceeded/RunSucceeded that
        // lands after a stop can observe it by loading the run and never
        // has to consult the cache to find out. The Deployer still does the
        // actual tenant tear-down, but it's no longer the one that decides
        // whether Stopped is the run's terminal state.
        let mut run = self.load_run(&run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        run.advance_status(Status::Stopped);
        run.completed_at = Some(Utc::now());
        self.project(&run, "stopping").await;
        self.save_run(run).await
    }
}

impl EventHandler for Coordinator {
    fn handle<'a>(&'a self, event: Event) -> Pin<Box<dyn Future<Output = HandlerOutcome> + Send + 'a>> {
        Box::pin(async move {
            match self.handle(event).await {
                Ok(()) => HandlerOutcome::Ack,
                Err(Error::TransientDependency(msg)) => {
                    tracing::warn!(error = %msg, "coordinator retry");
                    HandlerOutcome::Retry
                }
                Err(e) => {
                    tracing::error!(error = %e, "coordinator handler error, acknowledging to avoid poison loop");
                    HandlerOutcome::Ack
                }
            }
        })
    }
}

/// Extension used only for the silent-drop comparison in
/// `on_build_progress` — `Status` already encodes rank internally but
/// doesn't expose it, so this mirrors the same order for the one place a
/// caller needs to compare without advancing.
trait StatusRank {
    fn rank_position(&self) -> u8;
}

impl StatusRank for Status {
    fn rank_position(&self) -> u8 {
        match self {
            Status::Queued => 0,
            Status::Building => 1,
            Status::Deploying => 2,
            Status::Running => 3,
            Status::Succeeded | Status::Failed | Status::Stopped => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reporunner_store::{SqliteDocumentStore, SqliteStoreConfig};
    use reporunner_types::RunPayload;
    use std::sync::Mutex;

    struct FakeCache {
        last: Mutex<Option<StatusProjection>>,
    }

    impl FakeCache {
        fn new() -> Self {
            Self { last: Mutex::new(None) }
        }
    }

    impl Cache for FakeCache {
        fn get_status(
            &self,
            _run_id: &String,
        ) -> Pin<Box<dyn Future<Output = Result<Option<StatusProjection>>> + Send + '_>> {
            Box::pin(async move { Ok(self.last.lock().unwrap().clone()) })
        }

        fn put_status(&self, projection: &StatusProjection) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let projection = projection.clone();
            Box::pin(async move {
                *self.last.lock().unwrap() = Some(projection);
                Ok(())
            })
        }

        fn delete_status(&self, _run_id: &String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                *self.last.lock().unwrap() = None;
                Ok(())
            })
        }
    }

    fn coordinator() -> Coordinator {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SqliteDocumentStore::new(SqliteStoreConfig {
                path: dir.path().join("test.sqlite3"),
                busy_timeout_ms: 5_000,
            })
            .unwrap(),
        );
        std::mem::forget(dir);
        Coordinator::new(store, Arc::new(FakeCache::new()))
    }

    #[tokio::test]
    async fn run_requested_is_idempotent() {
        let c = coordinator();
        let ev = Event::RunRequested {
            run_id: "r1".to_string(),
            repo: "https://example.invalid/x.git".to_string(),
            branch: "main".to_string(),
            mode: Mode::SingleImage,
            compose_path: None,
            primary_service: None,
        };
        c.handle(ev.clone()).await.unwrap();
        c.handle(ev).await.unwrap();
        let run = c.load_run("r1").await.unwrap();
        assert_eq!(run.status, Status::Queued);
    }

    #[tokio::test]
    async fn build_failed_after_run_succeeded_is_rejected_by_monotonic_rule() {
        let c = coordinator();
        c.on_run_requested(
            "r1".to_string(),
            "https://example.invalid/x.git".to_string(),
            "main".to_string(),
            Mode::SingleImage,
            None,
            None,
        )
        .await
        .unwrap();

        c.on_run_succeeded("r1".to_string(), "http://localhost:8080".to_string(), "run-r1".to_string(), Utc::now())
            .await
            .unwrap();

        c.on_build_failed("r1".to_string(), "boom".to_string(), Utc::now(), None).await.unwrap();

        let run = c.load_run("r1").await.unwrap();
        assert_eq!(run.status, Status::Running);
    }

    #[tokio::test]
    async fn missing_run_on_non_request_event_retries() {
        let c = coordinator();
        let outcome = c.on_build_succeeded(
            "missing".to_string(),
            RunPayload::SingleImage {
                image_ref: "missing:latest".to_string(),
                ports: vec![8080],
                source: reporunner_types::ImageSource::Built,
            },
            None,
        )
        .await;
        assert!(matches!(outcome, Err(Error::TransientDependency(_))));
    }
}
