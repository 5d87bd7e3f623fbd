//! # atlas-syncd
//!
//! The Atlas sync daemon. Two process roles share one binary:
//!
//! - `atlas-syncd consume --name <consumer>` — long-running stream consumer
//! - `atlas-syncd reconcile [--once]` — reconciliation loop or one-shot
//!
//! Both terminate cleanly on SIGINT/SIGTERM: a shared flag is set by the
//! signal task and observed at the top of each loop iteration.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use atlas_broker::{Broker, SqliteBroker};
use atlas_core::RunType;
use atlas_settings::AtlasSettings;
use atlas_store::{ConnectionConfig, SyncStore};
use atlas_sync::{
    ConflictDetector, Consumer, ConsumerConfig, Publisher, PublisherConfig, Reconciler,
    ReconcilerConfig,
};
use atlas_syncd::providers::{SqliteGraphStore, SqliteSourceStore};

/// Atlas sync daemon.
#[derive(Parser, Debug)]
#[command(name = "atlas-syncd", about = "Atlas graph synchronization daemon")]
struct Cli {
    /// Path to the `SQLite` database (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a stream consumer.
    Consume {
        /// Unique consumer name within the group.
        #[arg(long, default_value = "consumer-1")]
        name: String,
    },
    /// Run the reconciliation job.
    Reconcile {
        /// Run one pass and exit instead of looping.
        #[arg(long)]
        once: bool,
    },
}

/// Shared services wired once at process start and injected everywhere.
struct Services {
    settings: AtlasSettings,
    store: Arc<SyncStore>,
    broker: Arc<SqliteBroker>,
    source: Arc<SqliteSourceStore>,
    graph: Arc<SqliteGraphStore>,
}

fn build_services(db_path: Option<PathBuf>) -> Result<Services> {
    let mut settings = atlas_settings::load_settings().unwrap_or_default();
    if let Some(path) = db_path {
        settings.database.path = path.to_string_lossy().into_owned();
    }

    ensure_parent_dir(Path::new(&settings.database.path))?;
    let pool = atlas_store::new_file(
        &settings.database.path,
        &ConnectionConfig {
            pool_size: settings.database.pool_size,
            ..ConnectionConfig::default()
        },
    )
    .context("failed to open database")?;
    {
        let conn = pool.get().context("failed to get a connection")?;
        let _ = atlas_store::run_migrations(&conn).context("failed to run migrations")?;
    }

    let store = Arc::new(SyncStore::new(pool.clone()));
    let broker = Arc::new(SqliteBroker::new(pool.clone()).context("failed to open broker")?);
    broker
        .ensure_stream(&settings.broker.stream, &settings.broker.group)
        .context("failed to ensure stream")?;

    let source = Arc::new(SqliteSourceStore::new(pool.clone()));
    source.ensure_schema().context("failed to ensure source schema")?;
    let graph = Arc::new(SqliteGraphStore::new(pool));
    graph.ensure_schema().context("failed to ensure graph schema")?;

    Ok(Services {
        settings,
        store,
        broker,
        source,
        graph,
    })
}

fn publisher_for(services: &Services) -> Publisher {
    Publisher::new(
        services.store.clone(),
        services.broker.clone(),
        PublisherConfig {
            stream: services.settings.broker.stream.clone(),
            max_len: services.settings.broker.max_len,
            retry: services.settings.retry.clone(),
        },
    )
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn init_tracing(filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Set `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: Arc<AtomicBool>) {
    drop(tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown.store(true, Ordering::Relaxed);
    }));
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            error!(error = %err, "SIGTERM handler unavailable, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let services = build_services(cli.db_path)?;
    init_tracing(&services.settings.logging.filter);

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_listener(shutdown.clone());

    match cli.command {
        Command::Consume { name } => {
            let consumer = Consumer::new(
                services.store.clone(),
                services.broker.clone(),
                services.graph.clone(),
                ConsumerConfig {
                    stream: services.settings.broker.stream.clone(),
                    group: services.settings.broker.group.clone(),
                    consumer_name: name,
                    batch_size: services.settings.consumer.batch_size,
                    block_ms: services.settings.consumer.block_ms,
                },
            );
            let flag = shutdown.clone();
            tokio::task::spawn_blocking(move || consumer.run(&flag))
                .await
                .context("consumer task panicked")?
                .context("consumer failed")?;
        }
        Command::Reconcile { once } => {
            let reconciler = Reconciler::new(
                services.store.clone(),
                publisher_for(&services),
                ConflictDetector::new(
                    services.source.clone(),
                    services.graph.clone(),
                    services.store.clone(),
                ),
                services.source.clone(),
                services.graph.clone(),
                ReconcilerConfig {
                    interval_secs: services.settings.reconciliation.interval_secs,
                    batch_size: services.settings.reconciliation.batch_size,
                    stale_threshold_secs: services.settings.reconciliation.stale_threshold_secs,
                    conflict_detection: services.settings.reconciliation.conflict_detection,
                    auto_repair: services.settings.reconciliation.auto_repair,
                    holder: format!("reconciler-{}", std::process::id()),
                },
            );
            if once {
                let run = tokio::task::spawn_blocking(move || reconciler.run_once(RunType::Manual))
                    .await
                    .context("reconciliation task panicked")?
                    .context("reconciliation run failed")?;
                info!(run_id = %run.id, status = %run.status, "one-shot reconciliation finished");
            } else {
                let flag = shutdown.clone();
                tokio::task::spawn_blocking(move || reconciler.run_loop(&flag))
                    .await
                    .context("reconciliation task panicked")?;
            }
        }
    }

    info!("shutdown complete");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_consume_default_name() {
        let cli = Cli::parse_from(["atlas-syncd", "consume"]);
        match cli.command {
            Command::Consume { name } => assert_eq!(name, "consumer-1"),
            Command::Reconcile { .. } => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn cli_consume_custom_name() {
        let cli = Cli::parse_from(["atlas-syncd", "consume", "--name", "worker-7"]);
        match cli.command {
            Command::Consume { name } => assert_eq!(name, "worker-7"),
            Command::Reconcile { .. } => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn cli_reconcile_defaults_to_loop() {
        let cli = Cli::parse_from(["atlas-syncd", "reconcile"]);
        match cli.command {
            Command::Reconcile { once } => assert!(!once),
            Command::Consume { .. } => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn cli_reconcile_once() {
        let cli = Cli::parse_from(["atlas-syncd", "reconcile", "--once"]);
        match cli.command {
            Command::Reconcile { once } => assert!(once),
            Command::Consume { .. } => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn cli_db_path_override() {
        let cli = Cli::parse_from(["atlas-syncd", "--db-path", "/tmp/x.db", "consume"]);
        assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/x.db")));
    }

    #[test]
    fn ensure_parent_dir_creates_nested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("atlas.db");
        ensure_parent_dir(&path).unwrap();
        assert!(path.parent().unwrap().exists());
    }

    #[test]
    fn services_bootstrap_on_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("atlas.db");
        let services = build_services(Some(db_path.clone())).unwrap();
        assert!(db_path.exists());

        // The audit tables exist and a run can be recorded end to end.
        let run = services
            .store
            .begin_run(RunType::Manual, 10)
            .unwrap();
        assert_eq!(run.status, "RUNNING");
        assert_eq!(services.graph.node_count().unwrap(), 0);
    }
}
