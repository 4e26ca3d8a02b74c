//! Projection-only status cache (§6: key `runstatus:<runId>`). Any worker
//! may write; the Edge Adapter reads. Writes always land in the document
//! store first — this cache is a fast-read mirror, never authoritative.
//!
//! Method signatures follow the `Pin<Box<dyn Future>>` shape used for async
//! trait objects without pulling in `async-trait`: a trait object callers
//! hold as `&dyn Cache` or `Arc<dyn Cache>` across worker loops.

use std::future::Future;
use std::pin::Pin;

use reporunner_types::{Error, Result, RunId, StatusProjection};

fn status_key(run_id: &str) -> String {
    format!("runstatus:{run_id}")
}

pub trait Cache: Send + Sync {
    fn get_status(&self, run_id: &RunId) -> Pin<Box<dyn Future<Output = Result<Option<StatusProjection>>> + Send + '_>>;

    fn put_status(&self, projection: &StatusProjection) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    fn delete_status(&self, run_id: &RunId) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Redis-backed implementation over a `ConnectionManager`, which
/// auto-reconnects on transient broker blips.
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let client = redis::Client::open(connection_string)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

impl Cache for RedisCache {
    fn get_status(
        &self,
        run_id: &RunId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StatusProjection>>> + Send + '_>> {
        let key = status_key(run_id);
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let raw: Option<String> = redis::AsyncCommands::get(&mut conn, &key).await?;
            Ok(match raw {
                Some(json) => Some(serde_json::from_str(&json).map_err(Error::from)?),
                None => None,
            })
        })
    }

    fn put_status(&self, projection: &StatusProjection) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let key = status_key(&projection.run_id);
        let json = serde_json::to_string(projection).map_err(Error::from);
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let json = json?;
            let _: () = redis::AsyncCommands::set(&mut conn, &key, json).await?;
            Ok(())
        })
    }

    fn delete_status(&self, run_id: &RunId) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let key = status_key(run_id);
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let _: i64 = redis::AsyncCommands::del(&mut conn, &key).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_key_matches_spec_format() {
        assert_eq!(status_key("run-123"), "runstatus:run-123");
    }
}
