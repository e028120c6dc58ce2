use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::PostmanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for OutboxStatus {
    type Error = PostmanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(OutboxStatus::Pending),
            "sent" => Ok(OutboxStatus::Sent),
            "failed" => Ok(OutboxStatus::Failed),
            _ => Err(PostmanError::UnknownStatus {
                kind: "outbox",
                value,
            }),
        }
    }
}

/// An outbound notification waiting for (or done with) mail delivery.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxMessage {
    pub id: String,
    pub session_id: String,
    /// RFC 5322 Message-ID used to thread replies back to the session.
    pub external_message_id: Option<String>,
    pub subject: String,
    pub body: String,
    #[sqlx(try_from = "String")]
    pub status: OutboxStatus,
    pub retry_count: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// A pending message carrying a freshly minted Message-ID.
    pub fn new(
        session_id: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            external_message_id: Some(new_message_id()),
            subject: subject.into(),
            body: body.into(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            created_at: Utc::now(),
            sent_at: None,
        }
    }
}

/// `<uuid@claude-postman>`
pub fn new_message_id() -> String {
    format!("<{}@claude-postman>", Uuid::new_v4())
}
