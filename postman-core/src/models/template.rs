use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message-ID of a "new session" template mail sent by this server.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TemplateRef {
    pub id: String,
    pub message_id: String,
    pub created_at: DateTime<Utc>,
}

impl TemplateRef {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.into(),
            created_at: Utc::now(),
        }
    }
}
