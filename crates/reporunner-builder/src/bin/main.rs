use std::sync::Arc;

use anyhow::Context;
use reporunner_builder::Builder;
use reporunner_cluster::ClusterClient;
use reporunner_eventlog::{Consumer, ConsumerConfig, Producer};
use reporunner_store::{SqliteDocumentStore, SqliteStoreConfig};

const STREAM: &str = "stream:repo-runs";
const GROUP: &str = "group:builder";
const EXPECTED_TYPES: &[&str] = &["run_requested"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = reporunner_config::load_config(&std::env::current_dir()?)?;

    let store = SqliteDocumentStore::new(SqliteStoreConfig {
        path: config.document_store.connection_string.clone().into(),
        busy_timeout_ms: 5_000,
    })
    .context("opening document store")?;

    let producer_conn = reporunner_eventlog::connect(&config.stream.connection_string)
        .await
        .context("connecting producer to event log")?;
    let producer = Producer::new(producer_conn, STREAM);

    let consumer_conn = reporunner_eventlog::connect(&config.stream.connection_string)
        .await
        .context("connecting consumer to event log")?;
    let consumer_identity = format!("builder-{}", std::process::id());
    let consumer_config = ConsumerConfig::new(STREAM, GROUP, consumer_identity, EXPECTED_TYPES.to_vec());
    let mut consumer = Consumer::new(consumer_conn, consumer_config)
        .await
        .context("joining consumer group")?;

    let cluster = ClusterClient::new(config.runner.cluster_binary.clone(), config.runner.kubeconfig_path.clone());
    let cpu_budget = reporunner_hostinfo::detect_cpu_budget().unwrap_or(2);

    let handler = Builder::new(
        Arc::new(store),
        producer,
        config.builder.work_directory.clone(),
        config.builder.image_build_binary.clone(),
        cluster,
        config.runner.image_loader_binary.clone(),
        config.runner.cluster_name.clone(),
        cpu_budget,
    );

    tracing::info!(stream = STREAM, group = GROUP, cpu_budget, "builder starting");

    tokio::select! {
        result = consumer.run(&handler) => {
            result.context("builder consume loop exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
