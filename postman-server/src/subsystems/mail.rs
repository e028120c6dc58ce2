//! Mail collaborator
//!
//! [`Mailer`] classifies unread mail into new-session requests and replies,
//! drains the outbox through a [`MailTransport`] with backoff, and sends the
//! "new session" template on startup. The transport itself is a thin seam;
//! the shipped one is the HTTP gateway in `gateway.rs`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use postman_core::config::MailConfig;
use postman_core::models::outbox::new_message_id;
use postman_core::models::{OutboxMessage, TemplateRef};
use postman_core::QueueStore;

use super::parse;

/// First retry waits this long; each further failure doubles it.
pub const RETRY_BASE_SECS: i64 = 30;

const TEMPLATE_TEXT: &str = "\
How to start a new agent session
================================

Do NOT change:
  - the subject line (it must keep the tag)
  - the recipient: reply to this mail, addressed to yourself
  - the \"Directory:\" and \"Model:\" keywords

You CAN edit:
  - the path after \"Directory:\" (e.g. ~/my-project)
  - the model after \"Model:\" (sonnet | opus | haiku)
  - the placeholder below, replaced with your task

------------------------------------

Directory: ~
Model: sonnet

(Write your task here)

------------------------------------

Every reply to this mail starts a separate session.
A fresh template is sent each time the server starts.";

#[derive(Error, Debug)]
pub enum MailError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway error ({code}): {message}")]
    Gateway { code: u16, message: String },

    #[error("All {attempts} gateway attempts failed: {last}")]
    RetryExhausted { attempts: usize, last: String },

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Invalid mail config: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// Transport seam
// ============================================================================

/// One unread mail as the transport sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawMail {
    pub uid: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Unread mail whose subject contains `subject_tag`.
    async fn fetch_unread(&self, subject_tag: &str) -> Result<Vec<RawMail>, MailError>;

    async fn mark_read(&self, uid: &str) -> Result<(), MailError>;

    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError>;
}

// ============================================================================
// Mailer
// ============================================================================

/// A classified inbound mail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingMessage {
    pub from: String,
    pub subject: String,
    /// For new sessions this is the parsed prompt, otherwise the raw body.
    pub body: String,
    pub message_id: String,
    pub session_id: Option<String>,
    pub is_new_session: bool,
    pub working_dir: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub rescheduled: usize,
    pub failed: usize,
    /// Rows whose outcome could not be written back.
    pub errors: usize,
}

#[derive(Clone)]
pub struct Mailer {
    store: QueueStore,
    transport: Arc<dyn MailTransport>,
    config: MailConfig,
}

impl Mailer {
    pub fn new(store: QueueStore, transport: Arc<dyn MailTransport>, config: MailConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Fetch and classify unread mail. Nothing is written to the queues here.
    /// A mail is marked read only once it has been classified; one that hits
    /// a store error stays unread and is retried on the next poll.
    pub async fn poll(&self) -> Result<Vec<IncomingMessage>, MailError> {
        let raws = self.transport.fetch_unread(&self.config.subject_tag).await?;
        let mut messages = Vec::with_capacity(raws.len());

        for raw in raws {
            if !sender_matches(&raw.from, &self.config.user) {
                tracing::debug!(from = %raw.from, "Ignoring mail from unauthorised sender");
                continue;
            }

            match self.classify_unless_template(&raw).await {
                Ok(Some(message)) => {
                    self.mark_read(&raw.uid).await;
                    messages.push(message);
                }
                Ok(None) => {
                    tracing::debug!(message_id = %raw.message_id, "Ignoring self-received template");
                    self.mark_read(&raw.uid).await;
                }
                Err(e) => {
                    tracing::error!(uid = %raw.uid, error = %e, "Failed to classify mail, leaving it unread");
                }
            }
        }

        Ok(messages)
    }

    /// `None` for the template mail we sent ourselves.
    async fn classify_unless_template(&self, raw: &RawMail) -> Result<Option<IncomingMessage>, MailError> {
        if self.store.is_template_ref(&raw.message_id).await? {
            return Ok(None);
        }
        self.classify(raw).await.map(Some)
    }

    async fn classify(&self, raw: &RawMail) -> Result<IncomingMessage, MailError> {
        let mut message = IncomingMessage {
            from: raw.from.clone(),
            subject: raw.subject.clone(),
            body: raw.body.clone(),
            message_id: raw.message_id.clone(),
            ..Default::default()
        };

        if self.references_template(raw).await? {
            let body = if parse::looks_like_html(&raw.body) {
                parse::extract_text_from_html(&raw.body)
            } else {
                raw.body.clone()
            };
            let fields = parse::parse_template(&body);
            message.is_new_session = true;
            message.working_dir = fields.working_dir;
            message.model = fields.model;
            message.body = fields.prompt;
            return Ok(message);
        }

        message.session_id = match parse::parse_session_id(&raw.body) {
            Some(id) => Some(id),
            None => self.session_by_thread(raw).await?,
        };
        Ok(message)
    }

    async fn references_template(&self, raw: &RawMail) -> Result<bool, MailError> {
        for id in thread_ids(raw) {
            if self.store.is_template_ref(id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn session_by_thread(&self, raw: &RawMail) -> Result<Option<String>, MailError> {
        for id in thread_ids(raw) {
            if let Some(session_id) = self.store.session_id_for_message(id).await? {
                return Ok(Some(session_id));
            }
        }
        Ok(None)
    }

    async fn mark_read(&self, uid: &str) {
        if let Err(e) = self.transport.mark_read(uid).await {
            tracing::warn!(uid = %uid, error = %e, "Failed to mark mail as read");
        }
    }

    /// Send every deliverable outbox row once. Failures are rescheduled with
    /// exponential backoff until `max_retries` is reached. A store error on
    /// one row is logged and the rest of the batch still goes out.
    pub async fn flush_outbox(&self) -> Result<FlushReport, MailError> {
        let mut report = FlushReport::default();

        for msg in self.store.list_deliverable_outbox().await? {
            if let Err(e) = self.flush_one(&msg, &mut report).await {
                tracing::error!(outbox_id = %msg.id, error = %e, "Failed to record outbox result");
                report.errors += 1;
            }
        }

        Ok(report)
    }

    async fn flush_one(&self, msg: &OutboxMessage, report: &mut FlushReport) -> Result<(), MailError> {
        let mail = OutgoingMail {
            from: self.config.user.clone(),
            to: self.config.user.clone(),
            subject: msg.subject.clone(),
            html_body: msg.body.clone(),
            message_id: msg.external_message_id.clone(),
            in_reply_to: None,
        };

        match self.transport.send(&mail).await {
            Ok(()) => {
                self.store.mark_outbox_sent(&msg.id).await?;
                report.sent += 1;
            }
            Err(e) => {
                let (retry_count, next_retry_at) =
                    retry_schedule(msg.retry_count, self.config.max_retries, Utc::now());
                tracing::warn!(
                    outbox_id = %msg.id,
                    session_id = %msg.session_id,
                    retry_count,
                    error = %e,
                    "Outbox send failed"
                );
                self.store
                    .mark_outbox_failed(&msg.id, retry_count, next_retry_at)
                    .await?;
                if next_retry_at.is_some() {
                    report.rescheduled += 1;
                } else {
                    tracing::error!(outbox_id = %msg.id, "Outbox message permanently failed");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Send the new-session template and remember its Message-ID so replies
    /// to it are recognised. Returns the Message-ID.
    pub async fn send_template(&self) -> Result<String, MailError> {
        let message_id = new_message_id();
        let mail = OutgoingMail {
            from: self.config.user.clone(),
            to: self.config.user.clone(),
            subject: format!("{} New Session", self.config.subject_tag),
            html_body: parse::render_plain(TEMPLATE_TEXT),
            message_id: Some(message_id.clone()),
            in_reply_to: None,
        };
        self.transport.send(&mail).await?;
        self.store.save_template(&TemplateRef::new(&message_id)).await?;
        Ok(message_id)
    }

    /// Queue a notification for `session_id` with a fresh Message-ID.
    pub async fn queue(&self, session_id: &str, subject: &str, html_body: &str) -> Result<OutboxMessage, MailError> {
        let msg = OutboxMessage::new(session_id, subject, html_body);
        self.store.create_outbox(&msg).await?;
        Ok(msg)
    }
}

/// Retry bookkeeping after a failed send: `(new_retry_count, next_retry_at)`.
/// `None` means the row has used its last attempt and becomes failed.
pub fn retry_schedule(
    retry_count: i64,
    max_retries: u32,
    now: DateTime<Utc>,
) -> (i64, Option<DateTime<Utc>>) {
    let attempts = retry_count + 1;
    if attempts >= i64::from(max_retries) {
        return (attempts, None);
    }
    let shift = u32::try_from(attempts - 1).unwrap_or(0).min(20);
    let backoff = Duration::seconds(RETRY_BASE_SECS * (1_i64 << shift));
    (attempts, Some(now + backoff))
}

fn thread_ids(raw: &RawMail) -> impl Iterator<Item = &str> {
    raw.in_reply_to
        .iter()
        .chain(raw.references.iter())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

/// Compare the address part of `from` ("Name <a@b>" or "a@b") with `user`.
fn sender_matches(from: &str, user: &str) -> bool {
    let address = match (from.rfind('<'), from.rfind('>')) {
        (Some(start), Some(end)) if start < end => &from[start + 1..end],
        _ => from,
    };
    address.trim().eq_ignore_ascii_case(user.trim())
}
