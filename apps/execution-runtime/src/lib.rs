#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use crate::{
    config::Config,
    db::ExecutionDb,
    execution::ExecutionService,
    presence::RecentMatchPresence,
    reconcile::ReconciliationReport,
};

pub mod chain;
pub mod config;
pub mod db;
pub mod execution;
pub mod presence;
pub mod quorum;
pub mod rate_limit;
pub mod reconcile;
pub mod rules;

#[derive(Clone)]
pub struct RuntimeState {
    pub config: Config,
    pub service: ExecutionService,
    pub db: Option<Arc<ExecutionDb>>,
}

pub async fn build_runtime_state(config: Config) -> Result<RuntimeState> {
    let db = match config.db_url.clone() {
        Some(url) => Some(Arc::new(ExecutionDb::connect(url.as_str()).await?)),
        None => None,
    };
    let (store, rules) = match db.clone() {
        Some(db) => (execution::store::postgres(db.clone()), rules::postgres(db)),
        None => {
            tracing::warn!("no DATABASE_URL configured; using in-memory execution store with no rules");
            (execution::store::memory(), rules::memory(Vec::new()))
        }
    };
    let presence = Arc::new(RecentMatchPresence::new(
        store.clone(),
        config.presence_window_seconds,
    ));
    let chain = chain::from_config(&config.chain_client_config());
    info!(
        service = %config.service_name,
        chain_backend = chain.backend(),
        presence_backend = "recent_match",
        challenge_policy = ?config.challenge_policy,
        "execution runtime initialized"
    );
    let service = ExecutionService::new(store, rules, presence, chain, config.execution_policy());
    Ok(RuntimeState {
        config,
        service,
        db,
    })
}

/// Run the reconciliation worker until Ctrl-C.
pub async fn serve(config: Config) -> Result<()> {
    let state = build_runtime_state(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = if state.config.reconciliation_enabled {
        info!(
            interval_seconds = state.config.reconciliation_interval_seconds,
            retention_seconds = state.config.retention_seconds,
            "reconciliation worker starting"
        );
        Some(reconcile::spawn_worker(
            state.service.clone(),
            Duration::from_secs(state.config.reconciliation_interval_seconds),
            shutdown_rx,
        ))
    } else {
        info!("reconciliation disabled (GEOTRIGGER_RECONCILIATION_ENABLED=false)");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    if let Some(worker) = worker {
        worker.await.context("join reconciliation worker")?;
    }
    Ok(())
}

pub async fn sweep_once(config: Config) -> Result<ReconciliationReport> {
    let state = build_runtime_state(config).await?;
    Ok(state.service.run_reconciliation().await)
}

pub async fn migrate(config: Config) -> Result<()> {
    let url = config
        .db_url
        .as_deref()
        .context("DATABASE_URL is required for migrate")?;
    let db = ExecutionDb::connect(url).await?;
    db.apply_migrations().await?;
    info!("execution schema applied");
    Ok(())
}
