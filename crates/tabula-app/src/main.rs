//! Tabula application binary - composition root.
//!
//! Ties together all Tabula crates into a single executable:
//! 1. Parse CLI flags and load configuration from TOML
//! 2. Open the SQLite database (optionally seeding the demo tables)
//! 3. Build the orchestrator over the rule model and SQLite executor
//! 4. Start the background sweeper (idle sessions, stale approvals)
//! 5. Serve the axum API until ctrl-c, then shut everything down

mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;

use tabula_api::routes;
use tabula_api::state::AppState;
use tabula_chat::{RuleModel, Settings, StreamingOrchestrator};
use tabula_core::config::TabulaConfig;
use tabula_storage::{seed_demo, Database, SqliteAuditLog, SqliteExecutor};

use crate::cli::CliArgs;

/// Periodically evict idle sessions and expire stale approvals until
/// `shutdown` flips.
async fn sweeper_loop(
    orchestrator: Arc<StreamingOrchestrator>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(interval_secs, "Sweeper started");

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = orchestrator.sweep().await;
                if report.evicted_sessions > 0 || report.abandoned_approvals > 0 {
                    tracing::info!(
                        evicted_sessions = report.evicted_sessions,
                        abandoned_approvals = report.abandoned_approvals,
                        pruned_approvals = report.pruned_approvals,
                        "Sweep"
                    );
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("Sweeper stopped");
}

/// Expand ~ to home directory in a path string.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// Database file: the configured path, or `<data_dir>/tabula.db`.
fn database_path(config: &TabulaConfig) -> PathBuf {
    if config.database.path.is_empty() {
        expand_home(&config.general.data_dir).join("tabula.db")
    } else {
        expand_home(&config.database.path)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config (loaded before tracing so the configured level applies).
    let config_file = args.resolve_config_path();
    let config_found = config_file.exists();
    let mut config = if config_found {
        TabulaConfig::load(&config_file)?
    } else {
        TabulaConfig::default()
    };
    args.apply(&mut config);
    config.validate()?;

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Tabula v{}", env!("CARGO_PKG_VERSION"));
    if config_found {
        tracing::info!(path = %config_file.display(), "Configuration loaded");
    } else {
        tracing::info!(path = %config_file.display(), "No configuration file, using defaults");
    }

    // Storage.
    let db_path = database_path(&config);
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    if config.database.seed_demo {
        db.with_conn(seed_demo)?;
        tracing::info!("Demo tables ready");
    }

    // Orchestration.
    let executor =
        Arc::new(SqliteExecutor::new(Arc::clone(&db)).with_max_rows(config.database.max_rows));
    let audit = Arc::new(SqliteAuditLog::new(Arc::clone(&db)));
    let orchestrator = Arc::new(
        StreamingOrchestrator::new(
            Arc::new(RuleModel::new()),
            executor,
            Settings::from_config(&config),
        )
        .with_audit(audit.clone()),
    );
    tracing::info!(
        max_retries = config.orchestrator.max_retries,
        max_admin_steps = config.orchestrator.max_admin_steps,
        "Orchestrator ready"
    );

    // === Background tasks ===

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(sweeper_loop(
        Arc::clone(&orchestrator),
        config.sessions.sweep_interval_secs,
        shutdown_rx,
    ));

    // === API server ===

    let state = AppState::new(Arc::clone(&orchestrator), config).with_audit(audit);
    let served = routes::start_server(state, shutdown_signal()).await;

    // Stop the sweeper and release the stores even if the server failed.
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Sweeper task failed");
    }
    orchestrator.close().await;
    tracing::info!("Tabula stopped");

    served?;
    Ok(())
}
