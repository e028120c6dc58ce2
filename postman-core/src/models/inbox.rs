use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A prompt queued for a session, delivered in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InboxMessage {
    pub id: String,
    pub session_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
}

impl InboxMessage {
    pub fn new(session_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            body: body.into(),
            created_at: Utc::now(),
            processed: false,
        }
    }
}
