//! Flush loop: hand deliverable outbox rows to the mail transport.

use tokio::sync::broadcast;

use super::mail::{FlushReport, Mailer};

pub async fn run_flush_loop(mailer: Mailer, interval_secs: u64, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!("Flush loop started (interval: {}s)", interval_secs);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match mailer.flush_outbox().await {
                    Ok(report) if report != FlushReport::default() => {
                        tracing::info!(
                            sent = report.sent,
                            rescheduled = report.rescheduled,
                            failed = report.failed,
                            errors = report.errors,
                            "Outbox flushed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Outbox flush failed: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Flush loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::mail::tests::{mail_config, FakeTransport};
    use postman_core::db::memory_pool;
    use postman_core::models::{OutboxStatus, Session};
    use postman_core::QueueStore;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_loop_flushes_on_first_tick_and_stops() {
        let store = QueueStore::new(memory_pool().await.unwrap());
        let session = Session::new("/w", "sonnet", "p");
        store.create_session(&session).await.unwrap();
        let transport = Arc::new(FakeTransport::default());
        let mailer = Mailer::new(store.clone(), transport.clone(), mail_config());
        let msg = mailer.queue(&session.id, "s", "b").await.unwrap();

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_flush_loop(mailer, 3600, rx));

        // The first tick fires immediately.
        for _ in 0..50 {
            if !transport.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert_eq!(
            store.get_outbox(&msg.id).await.unwrap().unwrap().status,
            OutboxStatus::Sent
        );
    }
}
