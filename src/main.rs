use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use feedcycle::config::Config;
use feedcycle::directory::DirectoryClient;
use feedcycle::pipeline::{CycleController, InvalidationHandler, Pipeline, StartOutcome};
use feedcycle::queue::SqliteJobQueue;
use feedcycle::storage::Database;
use feedcycle::worker::FeedWorker;

const IN_MEMORY: &str = ":memory:";

#[derive(Parser, Debug)]
#[command(
    name = "feedcycle",
    about = "Discover feeds from the user directory and keep them queued for processing"
)]
struct Args {
    /// Config file (TOML); missing file means defaults plus environment
    #[arg(long, value_name = "FILE", default_value = "feedcycle.toml")]
    config: PathBuf,

    /// Run a single discovery pass, print its report and exit
    #[arg(long)]
    once: bool,

    /// Do not start the bundled worker
    #[arg(long)]
    no_worker: bool,

    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?
        .with_env();
    config.validate().context("Invalid configuration")?;
    tracing::debug!(config = ?config, "Effective configuration");

    if args.reset_db && config.database_path != IN_MEMORY {
        let db_path = Path::new(&config.database_path);
        if db_path.exists() {
            std::fs::remove_file(db_path).context("Failed to delete database")?;
            println!("Database reset.");
        }
    }

    let db = Database::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path))?;

    let client = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .context("Failed to build HTTP client")?;

    let tokens = config
        .token_issuer(client.clone())
        .context("Invalid token configuration")?;
    let directory_url = config
        .directory_url
        .clone()
        .context("directory_url is not set")?;
    let directory = DirectoryClient::new(client.clone(), directory_url, tokens)
        .with_timeout(config.request_timeout())
        .allow_private_urls(config.allow_private_urls);

    let queue = SqliteJobQueue::new(db.clone());
    let requeued = queue
        .requeue_stalled()
        .await
        .context("Failed to recover stalled jobs")?;
    if requeued > 0 {
        tracing::info!(jobs = requeued, "Requeued jobs left active by a previous run");
    }

    let controller = CycleController::new(
        Arc::new(db.clone()),
        Arc::new(directory),
        Arc::new(queue.clone()),
        config.cycle_config(),
    );

    if args.once {
        return match controller.start().await {
            StartOutcome::Ran(Ok(report)) => {
                println!(
                    "Pass {}: {} known, {} discovered, {} created, {} enqueued",
                    report.pass, report.known, report.discovered, report.created, report.enqueued
                );
                Ok(())
            }
            StartOutcome::Ran(Err(e)) => Err(e).context("Discovery pass failed"),
            StartOutcome::Coalesced => anyhow::bail!("Another pass was already running"),
        };
    }

    let invalidation =
        InvalidationHandler::new(Arc::new(db.clone())).with_failure_log(Arc::new(queue.clone()));
    let mut handle = Pipeline::start(&controller, &invalidation, &queue);

    if config.worker.enabled && !args.no_worker {
        let worker = FeedWorker::new(client, db.clone(), queue.clone(), config.worker_config());
        handle.attach(worker.spawn(handle.shutdown_signal()));
    } else {
        tracing::info!("Bundled worker disabled; waiting for an external consumer");
    }

    wait_for_shutdown().await;
    tracing::info!("Shutdown requested");
    handle.stop().await;

    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }
}
