//! Serve mode — run controller plus REST API in one process.
//!
//! In this mode, the daemon:
//! 1. Opens the state store under the data directory
//! 2. Wires the webhook client and the store-backed workload registry
//! 3. Starts the run controller in the background
//! 4. Serves the REST API until Ctrl-C, then stops the controller

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use rollgate_api::ApiState;
use rollgate_core::DaemonConfig;
use rollgate_rollout::{BatchExecutor, RunController, StoreWorkloads, WorkloadRegistry};
use rollgate_state::StateStore;
use rollgate_webhook::{HttpWebhookClient, WebhookGate};

pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("rollgate daemon starting");

    // ── State store ──────────────────────────────────────────────
    std::fs::create_dir_all(&config.store.data_dir)?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Run controller ───────────────────────────────────────────
    let controller = Arc::new(build_controller(store.clone(), &config));
    let handle = controller.handle();
    info!(
        poll_secs = config.controller.poll_interval_secs,
        user_agent = %config.webhook.user_agent,
        "run controller initialized"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_handle = tokio::spawn(controller.run(shutdown_rx));

    // ── REST API server ──────────────────────────────────────────
    let router = rollgate_api::build_router(ApiState {
        store,
        controller: handle,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = controller_handle.await;
    info!("rollgate daemon stopped");
    Ok(())
}

/// Wire the executor against the store: every target type is served by
/// store-backed workloads that external agents report into.
fn build_controller(store: StateStore, config: &DaemonConfig) -> RunController {
    let registry =
        WorkloadRegistry::new().with_fallback(Arc::new(StoreWorkloads::new(store.clone())));
    let gate = WebhookGate::new(Arc::new(HttpWebhookClient::new(&config.webhook.user_agent)));
    let executor = BatchExecutor::new(
        registry,
        gate,
        Duration::from_secs(config.controller.poll_interval_secs.max(1)),
    );
    RunController::new(store, executor, config.controller.clone())
}
