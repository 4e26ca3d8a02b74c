use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reporunner_cache::{Cache, RedisCache};
use reporunner_edge::{EdgeAdapter, RunRequest};
use reporunner_eventlog::{Producer, DLQ_KEY};
use reporunner_store::{DocumentStore, SqliteDocumentStore, SqliteStoreConfig};
use reporunner_types::{LogSource, Mode};

const STREAM: &str = "stream:repo-runs";

#[derive(Parser, Debug)]
#[command(name = "reporunner", version)]
#[command(about = "Operator CLI for the repo-preview pipeline")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a RunRequested event.
    Run {
        /// Client-facing run identity. Must be unique; the Coordinator
        /// treats a repeat as an idempotent no-op.
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long, value_enum, default_value = "single-image")]
        mode: CliMode,
        #[arg(long)]
        compose_path: Option<String>,
        #[arg(long)]
        primary_service: Option<String>,
    },
    /// Submit a RunStopRequested event.
    Stop {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Read the cached status projection for a run.
    Status {
        #[arg(long)]
        run_id: String,
        /// Poll every second until the run reaches a terminal status.
        #[arg(long)]
        watch: bool,
    },
    /// Read stored log lines for a run.
    Logs {
        #[arg(long)]
        run_id: String,
        #[arg(long, value_enum)]
        source: Option<CliLogSource>,
        #[arg(long)]
        service: Option<String>,
    },
    /// Inspect or clear the dead-letter list.
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Connectivity check against the stream broker, cache, and document
    /// store configured in `reporunner.toml`.
    Doctor,
}

#[derive(Subcommand, Debug)]
enum DlqAction {
    /// Print every dead-lettered envelope descriptor.
    List,
    /// Delete the dead-letter list.
    Purge,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum CliMode {
    SingleImage,
    MultiService,
}

impl From<CliMode> for Mode {
    fn from(m: CliMode) -> Self {
        match m {
            CliMode::SingleImage => Mode::SingleImage,
            CliMode::MultiService => Mode::MultiService,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum CliLogSource {
    Build,
    Run,
}

impl From<CliLogSource> for LogSource {
    fn from(s: CliLogSource) -> Self {
        match s {
            CliLogSource::Build => LogSource::Build,
            CliLogSource::Run => LogSource::Run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let cli = Cli::parse();
    let config = reporunner_config::load_config(&std::env::current_dir()?)?;

    match cli.cmd {
        Commands::Run {
            run_id,
            repo,
            branch,
            mode,
            compose_path,
            primary_service,
        } => {
            let adapter = edge_adapter(&config).await?;
            adapter
                .submit_run(RunRequest {
                    run_id,
                    repo,
                    branch,
                    mode: mode.into(),
                    compose_path,
                    primary_service,
                })
                .await
                .context("submitting RunRequested")?;
            println!("submitted");
        }
        Commands::Stop { run_id, tenant } => {
            let adapter = edge_adapter(&config).await?;
            adapter.request_stop(run_id, tenant).await.context("submitting RunStopRequested")?;
            println!("stop requested");
        }
        Commands::Status { run_id, watch } => {
            let adapter = edge_adapter(&config).await?;
            if watch {
                watch_status(&adapter, &run_id).await?;
            } else {
                print_status(&adapter, &run_id).await?;
            }
        }
        Commands::Logs { run_id, source, service } => {
            let adapter = edge_adapter(&config).await?;
            let lines = adapter
                .tail_logs(run_id, source.map(Into::into), service)
                .await
                .context("reading log lines")?;
            for line in lines {
                println!("{} [{:?}] {}", line.timestamp.to_rfc3339(), line.source, line.line);
            }
        }
        Commands::Dlq { action } => dlq_command(&config, action).await?,
        Commands::Doctor => doctor(&config).await?,
    }

    Ok(())
}

async fn edge_adapter(config: &reporunner_config::Config) -> Result<EdgeAdapter> {
    let store = SqliteDocumentStore::new(SqliteStoreConfig {
        path: config.document_store.connection_string.clone().into(),
        busy_timeout_ms: 5_000,
    })
    .context("opening document store")?;
    let cache = RedisCache::connect(&config.cache.connection_string)
        .await
        .context("connecting to status cache")?;
    let conn = reporunner_eventlog::connect(&config.stream.connection_string)
        .await
        .context("connecting to event log")?;
    let producer = Producer::new(conn, STREAM);
    Ok(EdgeAdapter::new(producer, Arc::new(cache), Arc::new(store)))
}

async fn print_status(adapter: &EdgeAdapter, run_id: &str) -> Result<()> {
    match adapter.status_by_run_id(&run_id.to_string()).await? {
        Some(projection) => println!("{}", serde_json::to_string_pretty(&projection)?),
        None => println!("no projection for {run_id} yet"),
    }
    Ok(())
}

async fn watch_status(adapter: &EdgeAdapter, run_id: &str) -> Result<()> {
    let spinner = indicatif::ProgressBar::new_spinner();
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));
    loop {
        match adapter.status_by_run_id(&run_id.to_string()).await? {
            Some(projection) => {
                spinner.set_message(format!("{:?} — {}", projection.status, projection.progress));
                if projection.status.is_terminal() {
                    spinner.finish_with_message(format!("{:?} — {}", projection.status, projection.progress));
                    println!("{}", serde_json::to_string_pretty(&projection)?);
                    return Ok(());
                }
            }
            None => spinner.set_message(format!("waiting for {run_id} to be projected")),
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

async fn dlq_command(config: &reporunner_config::Config, action: DlqAction) -> Result<()> {
    let mut conn = reporunner_eventlog::connect(&config.stream.connection_string)
        .await
        .context("connecting to event log")?;
    match action {
        DlqAction::List => {
            let entries: Vec<String> = redis::AsyncCommands::lrange(&mut conn, DLQ_KEY, 0, -1)
                .await
                .context("reading dead-letter list")?;
            if entries.is_empty() {
                println!("dlq is empty");
            }
            for entry in entries {
                println!("{entry}");
            }
        }
        DlqAction::Purge => {
            let removed: i64 = redis::AsyncCommands::del(&mut conn, DLQ_KEY).await.context("purging dead-letter list")?;
            println!("purged {removed} key(s)");
        }
    }
    Ok(())
}

async fn doctor(config: &reporunner_config::Config) -> Result<()> {
    let mut ok = true;

    match reporunner_eventlog::connect(&config.stream.connection_string).await {
        Ok(_) => println!("[ok] event log reachable at {}", config.stream.connection_string),
        Err(e) => {
            ok = false;
            println!("[fail] event log: {e}");
        }
    }

    match RedisCache::connect(&config.cache.connection_string).await {
        Ok(cache) => {
            // A cache miss is a healthy "empty" read, not a failure.
            match cache.get_status(&"doctor-probe".to_string()).await {
                Ok(_) => println!("[ok] status cache reachable at {}", config.cache.connection_string),
                Err(e) => {
                    ok = false;
                    println!("[fail] status cache: {e}");
                }
            }
        }
        Err(e) => {
            ok = false;
            println!("[fail] status cache: {e}");
        }
    }

    match SqliteDocumentStore::new(SqliteStoreConfig {
        path: config.document_store.connection_string.clone().into(),
        busy_timeout_ms: 5_000,
    }) {
        Ok(store) => match store.list_runs(None, 1) {
            Ok(_) => println!("[ok] document store reachable at {}", config.document_store.connection_string),
            Err(e) => {
                ok = false;
                println!("[fail] document store: {e}");
            }
        },
        Err(e) => {
            ok = false;
            println!("[fail] document store: {e}");
        }
    }

    if !ok {
        anyhow::bail!("one or more dependencies failed the connectivity check");
    }
    Ok(())
}
