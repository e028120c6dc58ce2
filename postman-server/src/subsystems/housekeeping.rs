//! Housekeeping loop: purge old queue rows of ended sessions.

use tokio::sync::broadcast;

use postman_core::config::RetentionConfig;
use postman_core::QueueStore;

pub async fn run_housekeeping_loop(
    store: QueueStore,
    config: RetentionConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = tokio::time::Duration::from_secs(config.interval_hours.max(1) * 3600);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        "Housekeeping loop started (interval: {}h, retention: {}d)",
        config.interval_hours,
        config.days
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.purge_old_data(config.days).await {
                    Ok((outbox, inbox)) => {
                        tracing::info!(outbox_deleted = outbox, inbox_deleted = inbox, "Old queue data purged");
                    }
                    Err(e) => tracing::error!("Purge failed: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Housekeeping loop shutting down");
                break;
            }
        }
    }
}
