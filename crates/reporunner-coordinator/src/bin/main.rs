use std::sync::Arc;

use anyhow::Context;
use reporunner_cache::RedisCache;
use reporunner_coordinator::Coordinator;
use reporunner_eventlog::{self, Consumer, ConsumerConfig};
use reporunner_store::{SqliteDocumentStore, SqliteStoreConfig};

const STREAM: &str = "stream:repo-runs";
const GROUP: &str = "group:orchestrator";
const EXPECTED_TYPES: &[&str] = &[
    "run_requested",
    "run_stop_requested",
    "build_progress",
    "build_succeeded",
    "build_failed",
    "run_succeeded",
    "run_failed",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = reporunner_config::load_config(&std::env::current_dir()?)?;

    let store = SqliteDocumentStore::new(SqliteStoreConfig {
        path: config.document_store.connection_string.clone().into(),
        busy_timeout_ms: 5_000,
    })
    .context("opening document store")?;

    let cache = RedisCache::connect(&config.cache.connection_string)
        .await
        .context("connecting to projection cache")?;

    let consumer_identity = format!("coordinator-{}", std::process::id());
    let mut conn = reporunner_eventlog::connect(&config.stream.connection_string)
        .await
        .context("connecting to event log")?;

    if config.flush_streams_on_startup {
        // §9: exactly one worker should be designated as the purger. The
        // Coordinator is the natural choice — it's the first to observe a
        // run and the one every other worker treats as the source of truth
        // for whether a Run document already exists.
        reporunner_eventlog::cleanup(&mut conn, &[STREAM, "stream:indexing"])
            .await
            .context("flushing streams on startup")?;
        tracing::warn!("flushed streams and dead-letter list on startup");
    }

    let consumer_config = ConsumerConfig::new(STREAM, GROUP, consumer_identity, EXPECTED_TYPES.to_vec());
    let mut consumer = Consumer::new(conn, consumer_config)
        .await
        .context("joining consumer group")?;

    let handler = Coordinator::new(Arc::new(store), Arc::new(cache));

    tracing::info!(stream = STREAM, group = GROUP, "coordinator starting");

    tokio::select! {
        result = consumer.run(&handler) => {
            result.context("coordinator consume loop exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
