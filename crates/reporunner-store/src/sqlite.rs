//! SQLite-backed `DocumentStore`, WAL mode. One connection guarded by a
//! mutex — contention is low (a handful of workers, not a request-per-thread
//! web server) so a connection pool would be premature.

use std::path::PathBuf;
use std::sync::Mutex;

use reporunner_types::{BuildLog, Error, LogLine, LogSource, Result, Run, RunId};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("reporunner.sqlite3"),
            busy_timeout_ms: 5_000,
        }
    }
}

pub struct SqliteDocumentStore {
    connection: Mutex<Connection>,
}

impl SqliteDocumentStore {
    pub fn new(config: SqliteStoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let connection = Connection::open(&config.path)?;
        connection.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        connection.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;
        initialize_schema(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }
}

fn initialize_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            repo TEXT NOT NULL,
            created_at TEXT NOT NULL,
            document TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_runs_repo_created_at ON runs (repo, created_at DESC);

        CREATE TABLE IF NOT EXISTS build_logs (
            run_id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            source TEXT NOT NULL,
            service_name TEXT,
            line TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_logs_run_source_service_ts
            ON logs (run_id, source, service_name, timestamp);",
    )?;
    Ok(())
}

fn source_label(source: LogSource) -> &'static str {
    match source {
        LogSource::Build => "build",
        LogSource::Run => "run",
    }
}

fn parse_source(label: &str) -> Result<LogSource> {
    match label {
        "build" => Ok(LogSource::Build),
        "run" => Ok(LogSource::Run),
        other => Err(Error::Serialization(serde_json::Error::io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown log source: {other}"),
        )))),
    }
}

impl crate::DocumentStore for SqliteDocumentStore {
    fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let guard = self.connection.lock().expect("store mutex poisoned");
        let document: Option<String> = guard
            .query_row("SELECT document FROM runs WHERE run_id = ?1", params![run_id], |row| row.get(0))
            .optional()?;
        Ok(match document {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    fn put_run(&self, run: &Run) -> Result<()> {
        let document = serde_json::to_string(run)?;
        let guard = self.connection.lock().expect("store mutex poisoned");
        guard.execute(
            "INSERT INTO runs (run_id, repo, created_at, document) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id) DO UPDATE SET repo = excluded.repo, document = excluded.document",
            params![run.run_id, run.repo, run.created_at.to_rfc3339(), document],
        )?;
        Ok(())
    }

    fn list_runs(&self, repo: Option<&str>, limit: usize) -> Result<Vec<Run>> {
        let guard = self.connection.lock().expect("store mutex poisoned");
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = Vec::new();

        if let Some(repo) = repo {
            let mut stmt = guard.prepare(
                "SELECT document FROM runs WHERE repo = ?1 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let mapped = stmt.query_map(params![repo, limit], |row| row.get::<_, String>(0))?;
            for row in mapped {
                rows.push(row?);
            }
        } else {
            let mut stmt =
                guard.prepare("SELECT document FROM runs ORDER BY repo ASC, created_at DESC LIMIT ?1")?;
            let mapped = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
            for row in mapped {
                rows.push(row?);
            }
        }

        rows.into_iter()
            .map(|json| serde_json::from_str(&json).map_err(Error::from))
            .collect()
    }

    fn append_build_log(&self, run_id: &RunId, chunk: &str, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let guard = self.connection.lock().expect("store mutex poisoned");
        let existing: Option<String> = guard
            .query_row("SELECT text FROM build_logs WHERE run_id = ?1", params![run_id], |row| row.get(0))
            .optional()?;
        let text = match existing {
            Some(mut text) => {
                text.push_str(chunk);
                text
            }
            None => chunk.to_string(),
        };
        guard.execute(
            "INSERT INTO build_logs (run_id, text, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(run_id) DO UPDATE SET text = excluded.text",
            params![run_id, text, now.to_rfc3339()],
        )?;
        Ok(())
    }

    fn get_build_log(&self, run_id: &str) -> Result<Option<BuildLog>> {
        let guard = self.connection.lock().expect("store mutex poisoned");
        let row: Option<(String, String)> = guard
            .query_row(
                "SELECT text, created_at FROM build_logs WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((text, created_at)) => Some(BuildLog {
                run_id: run_id.to_string(),
                text,
                created_at: parse_rfc3339(&created_at)?,
            }),
            None => None,
        })
    }

    fn append_log_line(&self, line: &LogLine) -> Result<()> {
        let guard = self.connection.lock().expect("store mutex poisoned");
        guard.execute(
            "INSERT INTO logs (run_id, source, service_name, line, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                line.run_id,
                source_label(line.source),
                line.service_name,
                line.line,
                line.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn list_log_lines(
        &self,
        run_id: &str,
        source: Option<LogSource>,
        service_name: Option<&str>,
    ) -> Result<Vec<LogLine>> {
        let guard = self.connection.lock().expect("store mutex poisoned");
        let source_label = source.map(source_label);

        let mut stmt = guard.prepare(
            "SELECT source, service_name, line, timestamp FROM logs
             WHERE run_id = ?1
               AND (?2 IS NULL OR source = ?2)
               AND (?3 IS NULL OR service_name = ?3)
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![run_id, source_label, service_name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (source, service_name, line, timestamp) = row?;
            out.push(LogLine {
                run_id: run_id.to_string(),
                source: parse_source(&source)?,
                service_name,
                line,
                timestamp: parse_rfc3339(&timestamp)?,
            });
        }
        Ok(out)
    }
}

fn parse_rfc3339(value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| {
            Error::Serialization(serde_json::Error::io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            )))
        })
}
