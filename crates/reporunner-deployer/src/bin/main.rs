use std::sync::Arc;

use anyhow::Context;
use reporunner_cache::RedisCache;
use reporunner_cluster::ClusterClient;
use reporunner_deployer::{Deployer, DeployerConfig};
use reporunner_eventlog::{Consumer, ConsumerConfig, Producer};
use reporunner_store::{SqliteDocumentStore, SqliteStoreConfig};

const STREAM: &str = "stream:repo-runs";
const GROUP: &str = "group:runner";
const EXPECTED_TYPES: &[&str] = &["build_succeeded", "run_stop_requested"];

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
        .context("connecting to status cache")?;

    let producer_conn = reporunner_eventlog::connect(&config.stream.connection_string)
        .await
        .context("connecting producer to event log")?;
    let producer = Producer::new(producer_conn, STREAM);

    let consumer_conn = reporunner_eventlog::connect(&config.stream.connection_string)
        .await
        .context("connecting consumer to event log")?;
    let consumer_identity = format!("deployer-{}", std::process::id());
    let consumer_config = ConsumerConfig::new(STREAM, GROUP, consumer_identity, EXPECTED_TYPES.to_vec());
    let mut consumer = Consumer::new(consumer_conn, consumer_config)
        .await
        .context("joining consumer group")?;

    let cluster = ClusterClient::new(config.runner.cluster_binary.clone(), config.runner.kubeconfig_path.clone());

    let deployer = Arc::new(Deployer::new(
        Arc::new(store),
        Arc::new(cache),
        producer,
        cluster,
        DeployerConfig {
            cpu_limit: config.runner.cpu_limit.clone(),
            memory_limit: config.runner.memory_limit.clone(),
            cpu_request: config.runner.cpu_request.clone(),
            memory_request: config.runner.memory_request.clone(),
            namespace_ttl_hours: config.runner.namespace_ttl_hours,
            fallback_node_port: config.runner.node_port,
        },
    ));

    let reaper = deployer.clone();
    let reaper_interval = config.runner.ttl_reaper_interval;
    tokio::spawn(async move {
        reaper.run_ttl_reaper(reaper_interval).await;
    });

    tracing::info!(stream = STREAM, group = GROUP, "deployer starting");

    tokio::select! {
        result = consumer.run(deployer.as_ref()) => {
            result.context("deployer consume loop exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
