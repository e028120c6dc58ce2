//! Poll loop: unread mail → new sessions and queued replies.

use tokio::sync::broadcast;

use postman_core::models::{InboxMessage, SessionStatus};

use super::mail::{IncomingMessage, Mailer};
use super::orchestrator::Orchestrator;

/// Fallbacks for template replies that leave a field out.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub model: String,
    pub working_dir: String,
}

impl SessionDefaults {
    /// `model` plus the user's home directory.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            working_dir: shellexpand::tilde("~").into_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub created: usize,
    pub enqueued: usize,
    pub dropped: usize,
    pub errors: usize,
}

pub async fn run_poll_loop(
    mailer: Mailer,
    orchestrator: Orchestrator,
    defaults: SessionDefaults,
    interval_secs: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!("Poll loop started (interval: {}s)", interval_secs);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match mailer.poll().await {
                    Ok(messages) if messages.is_empty() => {}
                    Ok(messages) => {
                        let report = process_messages(messages, &orchestrator, &defaults).await;
                        tracing::info!(
                            created = report.created,
                            enqueued = report.enqueued,
                            dropped = report.dropped,
                            errors = report.errors,
                            "Mail poll processed"
                        );
                    }
                    Err(e) => tracing::error!("Mail poll failed: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Poll loop shutting down");
                break;
            }
        }
    }
}

/// Act on one poll's worth of classified mail. One message failing does not
/// stop the rest.
pub async fn process_messages(
    messages: Vec<IncomingMessage>,
    orchestrator: &Orchestrator,
    defaults: &SessionDefaults,
) -> PollReport {
    let mut report = PollReport::default();

    for msg in messages {
        if msg.is_new_session {
            if msg.body.trim().is_empty() {
                tracing::warn!(message_id = %msg.message_id, "Template reply has no task, ignoring");
                report.dropped += 1;
                continue;
            }
            let model = msg.model.as_deref().unwrap_or(&defaults.model);
            let working_dir = msg.working_dir.as_deref().unwrap_or(&defaults.working_dir);
            match orchestrator.create(working_dir, model, &msg.body).await {
                Ok(_) => report.created += 1,
                Err(e) => {
                    tracing::error!(message_id = %msg.message_id, error = %e, "Failed to create session");
                    report.errors += 1;
                }
            }
            continue;
        }

        let Some(session_id) = msg.session_id.as_deref() else {
            tracing::warn!(from = %msg.from, subject = %msg.subject, "Ignoring unmatched mail");
            report.dropped += 1;
            continue;
        };

        match enqueue_reply(orchestrator, session_id, &msg.body).await {
            Ok(true) => report.enqueued += 1,
            Ok(false) => report.dropped += 1,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to enqueue reply");
                report.errors += 1;
            }
        }
    }

    report
}

/// Queue a reply for a live session. `false` when the session is unknown or
/// ended and the reply was dropped.
async fn enqueue_reply(orchestrator: &Orchestrator, session_id: &str, body: &str) -> Result<bool, sqlx::Error> {
    let store = orchestrator.store();
    match store.get_session(session_id).await? {
        Some(session) if session.status != SessionStatus::Ended => {
            store.enqueue_inbox(&InboxMessage::new(session_id, body)).await?;
            tracing::debug!(session_id = %session_id, "Reply queued");
            Ok(true)
        }
        Some(_) => {
            tracing::warn!(session_id = %session_id, "Reply to ended session dropped");
            Ok(false)
        }
        None => {
            tracing::warn!(session_id = %session_id, "Reply to unknown session dropped");
            Ok(false)
        }
    }
}
