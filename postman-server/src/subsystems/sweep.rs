//! Sweep loop: feed queued prompts to sessions that are idle or waiting.

use tokio::sync::broadcast;

use postman_core::models::SessionStatus;

use super::orchestrator::{Orchestrator, SessionError};

pub async fn run_sweep_loop(orchestrator: Orchestrator, interval_secs: u64, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!("Sweep loop started (interval: {}s)", interval_secs);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sweep_once(&orchestrator).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Sweep delivered {} queued prompt(s)", n),
                    Err(e) => tracing::error!("Sweep failed: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Sweep loop shutting down");
                break;
            }
        }
    }
}

/// One pass of `deliver_next` over every idle or waiting session. Returns
/// how many prompts were delivered.
pub async fn sweep_once(orchestrator: &Orchestrator) -> Result<usize, SessionError> {
    let sessions = orchestrator
        .store()
        .list_sessions_by_status(&[SessionStatus::Idle, SessionStatus::Waiting])
        .await?;

    let mut delivered = 0;
    for session in sessions {
        match orchestrator.deliver_next(&session.id).await {
            Ok(Some(_)) => delivered += 1,
            Ok(None) => {}
            // A signal moved it on between the listing and the delivery.
            Err(SessionError::NotIdle { .. }) => {}
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "Delivery to idle session failed");
            }
        }
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::orchestrator::tests::{test_config, FakeRunner};
    use postman_core::db::memory_pool;
    use postman_core::models::{InboxMessage, Session};
    use postman_core::QueueStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sweep_delivers_to_idle_and_waiting_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(memory_pool().await.unwrap());
        let runner = Arc::new(FakeRunner::default());
        let orchestrator = Orchestrator::new(store.clone(), runner.clone(), test_config(dir.path()));

        let mut ids = Vec::new();
        for status in [
            SessionStatus::Idle,
            SessionStatus::Waiting,
            SessionStatus::Active,
            SessionStatus::Ended,
        ] {
            let mut session = Session::new("/w", "sonnet", "p");
            session.status = status;
            store.create_session(&session).await.unwrap();
            store
                .enqueue_inbox(&InboxMessage::new(&session.id, format!("for {}", status)))
                .await
                .unwrap();
            ids.push(session);
        }
        // An idle session with nothing queued stays untouched.
        let mut empty = Session::new("/w", "sonnet", "p");
        empty.status = SessionStatus::Idle;
        store.create_session(&empty).await.unwrap();

        assert_eq!(sweep_once(&orchestrator).await.unwrap(), 2);
        assert_eq!(runner.sent_to(&ids[0].runner_handle), vec!["for idle"]);
        assert_eq!(runner.sent_to(&ids[1].runner_handle), vec!["for waiting"]);
        assert!(runner.sent_to(&ids[2].runner_handle).is_empty());
        assert!(runner.sent_to(&ids[3].runner_handle).is_empty());
        assert_eq!(
            store.get_session(&empty.id).await.unwrap().unwrap().status,
            SessionStatus::Idle
        );

        // Everything deliverable is consumed; a second pass is a no-op.
        assert_eq!(sweep_once(&orchestrator).await.unwrap(), 0);
    }
}
