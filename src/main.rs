//! Points Ledger service runner
//!
//! Loads `config/<env>.yaml`, opens the store, and runs the recovery worker
//! until Ctrl-C. The transfer API itself is embedded by the service layer.
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌────────────────┐
//! │  Config  │───▶│  Store   │───▶│ TransferEngine │
//! │  (YAML)  │    │ (PG/Mem) │    │ + Recovery     │
//! └──────────┘    └──────────┘    └────────────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;
use points_ledger::config::AppConfig;
use points_ledger::store::{MemoryStore, PgStore, PointsStore};
use points_ledger::transfer::{RecoveryWorker, TransferEngine, WorkerConfig};

// ============================================================
// ARGS
// ============================================================

/// Value of `--env` / `-e`, defaulting to `dev`
fn get_env() -> String {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if matches!(arg.as_str(), "--env" | "-e")
            && let Some(env) = args.next()
        {
            return env;
        }
    }
    "dev".to_string()
}

// ============================================================
// STORE
// ============================================================

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn PointsStore>> {
    match &config.postgres_url {
        Some(url) => {
            tracing::info!("[Store] Connecting to PostgreSQL...");
            let store = PgStore::connect(url, config.postgres_max_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            store
                .init_schema()
                .await
                .context("Failed to initialize schema")?;
            tracing::info!("[Store] PostgreSQL connected and schema initialized");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("[Store] No postgres_url configured; using the in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = points_ledger::logging::init_logging(&app_config)?;

    tracing::info!("Starting Points Ledger in {} mode", env);

    let store = open_store(&app_config).await?;
    store
        .health_check()
        .await
        .context("Store health check failed")?;

    let engine = Arc::new(TransferEngine::new(store, app_config.engine.clone()));
    let worker = RecoveryWorker::new(engine.clone(), WorkerConfig::from(&app_config.recovery));
    let recovery = tokio::spawn(async move {
        worker.run().await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    recovery.abort();

    Ok(())
}
