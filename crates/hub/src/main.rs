mod config;
mod controller;
mod crop;
mod dashboard;
mod feed;
mod poller;
mod remote;
mod state;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use controller::{run_lockout_timer, ActuatorController};
use poller::Poller;
use remote::{HttpStore, RemoteStore};
use state::EventLog;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Remote store + shared event log ─────────────────────────────
    let remote: Arc<dyn RemoteStore> = Arc::new(HttpStore::new(&cfg.remote));
    let events = EventLog::shared();
    events.write().await.record_system("hub started".to_string());

    // ── Actuator controller ─────────────────────────────────────────
    let controller = Arc::new(ActuatorController::new(
        Arc::clone(&remote),
        cfg.actuator.clone(),
        Arc::clone(&events),
    ));
    // Start from the remote's view when it is reachable; otherwise the
    // first poll tick retries.
    if let Err(e) = controller.refresh_status().await {
        warn!("initial actuator status read failed: {e}");
    }

    // ── Telemetry poller ────────────────────────────────────────────
    let poller = Poller::new(
        Arc::clone(&remote),
        cfg.channels.clone(),
        cfg.poller,
        Arc::clone(&events),
    )
    .with_controller(Arc::clone(&controller));

    let web_state = AppState {
        telemetry: poller.view(),
        controller: Arc::clone(&controller),
        events: Arc::clone(&events),
        remote,
        channels: Arc::new(cfg.channels.clone()),
        started_at: OffsetDateTime::now_utc(),
    };

    // ── Tasks ───────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller_task = tokio::spawn(poller.run(shutdown_rx.clone()));
    let timer_task = tokio::spawn(run_lockout_timer(
        Arc::clone(&controller),
        shutdown_rx.clone(),
    ));
    let mut web_task = tokio::spawn(web::serve(web_state, cfg.web.port, shutdown_rx));

    let web_exited = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
            None
        }
        joined = &mut web_task => Some(joined),
    };

    events.write().await.record_system("hub stopping".to_string());
    // Receivers may already be gone if every task exited.
    let _ = shutdown_tx.send(true);

    let web_result = match web_exited {
        Some(joined) => joined,
        None => web_task.await,
    };
    poller_task.await.context("poller task panicked")?;
    timer_task.await.context("lockout timer task panicked")?;
    web_result.context("web task panicked")??;

    info!("hub stopped");
    Ok(())
}
