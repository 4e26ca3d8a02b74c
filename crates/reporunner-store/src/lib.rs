//! Document store abstraction over the three collections of §6: `runs`,
//! `build_logs`, and `logs`. The [`DocumentStore`] trait is synchronous —
//! callers invoke it from a blocking context (`tokio::task::spawn_blocking`)
//! the same way the Coordinator and Deployer do for every other document
//! write, since a single SQLite connection guarded by a mutex is not worth
//! making async over.

mod sqlite;

pub use sqlite::{SqliteDocumentStore, SqliteStoreConfig};

use reporunner_types::{BuildLog, LogLine, LogSource, Result, Run, RunId};

/// Shared read/write document store. The Coordinator and Deployer mutate
/// disjoint fields of the same `Run` record; `put_run` is a coarse
/// replace-by-id, with the monotonic-status rule in `reporunner_types::Run`
/// as the only ordering guard.
pub trait DocumentStore: Send + Sync {
    fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Replace-by-id write. Callers load-modify-store; there is no
    /// optimistic-concurrency check beyond the monotonic-status rule baked
    /// into `Run::advance_status`.
    fn put_run(&self, run: &Run) -> Result<()>;

    /// Runs ordered by `(repo ASC, created_at DESC)`, optionally filtered to
    /// one repo URL.
    fn list_runs(&self, repo: Option<&str>, limit: usize) -> Result<Vec<Run>>;

    /// Append a chunk of build output, merging it into the run's single
    /// aggregated `BuildLog` document.
    fn append_build_log(&self, run_id: &RunId, chunk: &str, now: chrono::DateTime<chrono::Utc>) -> Result<()>;

    fn get_build_log(&self, run_id: &str) -> Result<Option<BuildLog>>;

    /// Append one line document to the append-only `logs` collection.
    fn append_log_line(&self, line: &LogLine) -> Result<()>;

    /// Lines for a run, optionally filtered by source and service name,
    /// ordered ascending by `timestamp`.
    fn list_log_lines(
        &self,
        run_id: &str,
        source: Option<LogSource>,
        service_name: Option<&str>,
    ) -> Result<Vec<LogLine>>;
}

#[cfg(test)]
mod contract_tests {
    use super::*;
    use reporunner_types::{Mode, Status};

    fn sample_run(id: &str) -> Run {
        Run::new_queued(
            id.to_string(),
            "https://example.invalid/x.git".to_string(),
            "main".to_string(),
            Mode::SingleImage,
            None,
            None,
            chrono::Utc::now(),
        )
    }

    fn exercise(store: &dyn DocumentStore) {
        assert!(store.get_run("r1").unwrap().is_none());

        let mut run = sample_run("r1");
        store.put_run(&run).unwrap();
        let loaded = store.get_run("r1").unwrap().unwrap();
        assert_eq!(loaded.status, Status::Queued);

        run.advance_status(Status::Building);
        store.put_run(&run).unwrap();
        let loaded = store.get_run("r1").unwrap().unwrap();
        assert_eq!(loaded.status, Status::Building);

        let now = chrono::Utc::now();
        store.append_build_log(&"r1".to_string(), "cloning...\n", now).unwrap();
        store.append_build_log(&"r1".to_string(), "building...\n", now).unwrap();
        let log = store.get_build_log("r1").unwrap().unwrap();
        assert_eq!(log.text, "cloning...\nbuilding...\n");

        let line = LogLine {
            run_id: "r1".to_string(),
            source: LogSource::Run,
            service_name: Some("web".to_string()),
            line: "listening on :8080".to_string(),
            timestamp: now,
        };
        store.append_log_line(&line).unwrap();
        let lines = store.list_log_lines("r1", Some(LogSource::Run), None).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, "listening on :8080");
    }

    #[test]
    fn sqlite_store_satisfies_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::new(SqliteStoreConfig {
            path: dir.path().join("reporunner.sqlite3"),
            busy_timeout_ms: 5_000,
        })
        .unwrap();
        exercise(&store);
    }

    #[test]
    fn list_runs_orders_by_repo_then_recency() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::new(SqliteStoreConfig {
            path: dir.path().join("reporunner.sqlite3"),
            busy_timeout_ms: 5_000,
        })
        .unwrap();

        let mut a = sample_run("a");
        a.repo = "https://example.invalid/same.git".to_string();
        let mut b = sample_run("b");
        b.repo = "https://example.invalid/same.git".to_string();
        b.created_at = a.created_at + chrono::Duration::seconds(5);

        store.put_run(&a).unwrap();
        store.put_run(&b).unwrap();

        let runs = store.list_runs(Some("https://example.invalid/same.git"), 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "b");
        assert_eq!(runs[1].run_id, "a");
    }
}
