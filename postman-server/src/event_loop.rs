//! Boot sequence and the periodic loops.
//!
//! Startup order matters: the template mail must go out before anything
//! else, then one recovery pass, then the loops and the control socket. All
//! loops share one shutdown broadcast. Session listeners are not tied to it
//! and keep running until their session ends or the process exits.

use std::path::Path;

use anyhow::Context;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use postman_core::PostmanConfig;

use crate::router::ControlState;
use crate::server;
use crate::subsystems::fifo;
use crate::subsystems::mail::Mailer;
use crate::subsystems::orchestrator::{Orchestrator, RecoveryReport};
use crate::subsystems::poll::SessionDefaults;
use crate::subsystems::{flush, housekeeping, poll, sweep};

/// Template send and crash recovery. Any error here aborts the boot.
pub async fn startup(
    config: &PostmanConfig,
    orchestrator: &Orchestrator,
    mailer: &Mailer,
) -> anyhow::Result<RecoveryReport> {
    let fifo_dir = config.fifo_dir();
    fifo::ensure_dir(Path::new(&fifo_dir))
        .with_context(|| format!("Failed to prepare fifo directory {}", fifo_dir))?;

    let template_id = mailer
        .send_template()
        .await
        .context("Failed to send the new-session template mail")?;
    tracing::info!(message_id = %template_id, "Template mail sent");

    orchestrator.recover_all().await.context("Crash recovery failed")
}

/// Spawn poll, flush, sweep and housekeeping, each subscribed to `shutdown`.
pub fn spawn_loops(
    config: &PostmanConfig,
    orchestrator: &Orchestrator,
    mailer: &Mailer,
    defaults: &SessionDefaults,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let general = &config.general;
    vec![
        tokio::spawn(poll::run_poll_loop(
            mailer.clone(),
            orchestrator.clone(),
            defaults.clone(),
            general.poll_interval_secs,
            shutdown.subscribe(),
        )),
        tokio::spawn(flush::run_flush_loop(
            mailer.clone(),
            general.flush_interval_secs,
            shutdown.subscribe(),
        )),
        tokio::spawn(sweep::run_sweep_loop(
            orchestrator.clone(),
            general.sweep_interval_secs,
            shutdown.subscribe(),
        )),
        tokio::spawn(housekeeping::run_housekeeping_loop(
            orchestrator.store().clone(),
            config.retention.clone(),
            shutdown.subscribe(),
        )),
    ]
}

/// Run until SIGINT or SIGTERM.
pub async fn run(config: PostmanConfig, orchestrator: Orchestrator, mailer: Mailer) -> anyhow::Result<()> {
    startup(&config, &orchestrator, &mailer).await?;

    let (tx, _rx) = broadcast::channel(1);
    let defaults = SessionDefaults::new(config.general.default_model.clone());
    let handles = spawn_loops(&config, &orchestrator, &mailer, &defaults, &tx);

    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!("Failed to listen for shutdown signals: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    let socket_path = shellexpand::tilde(&config.service.socket_path).into_owned();
    let state = ControlState { orchestrator, defaults };
    let served = server::run_unix_server(&socket_path, state, tx.subscribe()).await;
    if served.is_err() {
        // Stop the loops even when the socket died on its own.
        let _ = tx.send(());
    }

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Loop task failed: {}", e);
        }
    }
    tracing::info!("All loops stopped");
    served
}

async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = term.recv() => Ok(()),
    }
}
