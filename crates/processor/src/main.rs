//! The dispatcher binary: loads configuration, wires the Postgres job
//! store to the query runner, exporter, and transfer agent, and runs the
//! listener loop until shutdown.

use anyhow::{Context, Result};
use dispatcher_core::{Dispatcher, DispatcherConfig};
use exporter::FileExporter;
use job_store_postgres::{PgJobStore, PgSettingsStore};
use query_runner::AnyQueryRunner;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use transfer_agent::SshTransferAgent;
use tracing::info;
use uuid::Uuid;

/// Typed process configuration, loaded once from environment variables.
/// Parsing failures report the offending key name only, never its value,
/// since several of these (`database_url`) may carry embedded credentials.
struct Config {
    database_url: String,
    spool_root: PathBuf,
    chunk_size: usize,
    listener_interval_seconds: u64,
    global_max_parallel_queries: u32,
    default_max_parallel_queries: u32,
    shutdown_grace_seconds: u64,
    stale_threshold_seconds: i64,
    reclaim_interval_seconds: u64,
    lease_duration_seconds: u64,
    listener_log_level: String,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: require_env("database_url")?,
            spool_root: PathBuf::from(env_or("spool_root", "./spool")),
            chunk_size: parse_env("chunk_size", 1000)?,
            listener_interval_seconds: parse_env("listener_interval_seconds", 10)?,
            global_max_parallel_queries: parse_env("global_max_parallel_queries", 50)?,
            default_max_parallel_queries: parse_env(
                "default_max_parallel_queries",
                dispatcher_core::UserSettings::DEFAULT_MAX_PARALLEL_QUERIES,
            )?,
            shutdown_grace_seconds: parse_env("shutdown_grace_seconds", 30)?,
            stale_threshold_seconds: parse_env("stale_threshold_seconds", 300)?,
            reclaim_interval_seconds: parse_env("reclaim_interval_seconds", 300)?,
            lease_duration_seconds: parse_env("lease_duration_seconds", 120)?,
            listener_log_level: env_or("listener_log_level", "info"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable: {key}"))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for environment variable: {key}")),
        Err(_) => Ok(default),
    }
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.listener_log_level);

    let generation = Uuid::new_v4();
    info!(generation = %generation, "starting dispatcher");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the job store database")?;

    let store: Arc<dyn dispatcher_core::JobStore> =
        Arc::new(PgJobStore::new(pool.clone(), generation));
    let settings: Arc<dyn dispatcher_core::SettingsStore> = Arc::new(PgSettingsStore::new(pool));
    let query_runner = Arc::new(AnyQueryRunner::new(config.chunk_size));
    let file_exporter = Arc::new(FileExporter);
    let transfer = Arc::new(SshTransferAgent);

    let reclaimed = dispatcher_core::reclaim_on_startup(
        store.as_ref(),
        config.stale_threshold_seconds,
        generation,
    )
    .await?;
    info!(count = reclaimed.len(), "startup recovery complete");

    let shutdown = CancellationToken::new();
    let reclaim_handle = dispatcher_core::spawn_periodic_reclaim(
        Arc::clone(&store),
        Duration::from_secs(config.reclaim_interval_seconds),
        config.stale_threshold_seconds,
        generation,
        shutdown.clone(),
    );

    let dispatcher = Dispatcher::new(
        store,
        settings,
        query_runner,
        file_exporter,
        transfer,
        DispatcherConfig {
            listener_interval: Duration::from_secs(config.listener_interval_seconds),
            global_cap: config.global_max_parallel_queries,
            default_max_parallel_queries: config.default_max_parallel_queries,
            shutdown_grace: Duration::from_secs(config.shutdown_grace_seconds),
            job_timeout: None,
            spool_root: config.spool_root,
            lease_duration: Duration::from_secs(config.lease_duration_seconds),
        },
    );

    let run_handle = tokio::spawn(Dispatcher::run(dispatcher, shutdown.clone()));

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    shutdown.cancel();

    let _ = run_handle.await;
    let _ = reclaim_handle.await;

    Ok(())
}
