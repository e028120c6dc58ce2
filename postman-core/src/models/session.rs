use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::PostmanError;

/// Lifecycle of a terminal-backed agent session.
///
/// `Creating` and `Ended` are never re-entered; `Idle` and `Waiting` both
/// accept the next queued prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Creating,
    Active,
    Idle,
    Waiting,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Ended => "ended",
        }
    }

    /// Statuses in which a queued prompt may be delivered.
    pub fn accepts_delivery(&self) -> bool {
        matches!(self, SessionStatus::Idle | SessionStatus::Waiting)
    }

    /// Statuses that a restarted server must try to recover.
    pub const RECOVERABLE: [SessionStatus; 3] = [
        SessionStatus::Active,
        SessionStatus::Idle,
        SessionStatus::Waiting,
    ];

    pub const LIVE: [SessionStatus; 4] = [
        SessionStatus::Creating,
        SessionStatus::Active,
        SessionStatus::Idle,
        SessionStatus::Waiting,
    ];
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = PostmanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "creating" => Ok(SessionStatus::Creating),
            "active" => Ok(SessionStatus::Active),
            "idle" => Ok(SessionStatus::Idle),
            "waiting" => Ok(SessionStatus::Waiting),
            "ended" => Ok(SessionStatus::Ended),
            _ => Err(PostmanError::UnknownStatus {
                kind: "session",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub runner_handle: String,
    pub working_dir: String,
    pub model: String,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_prompt: Option<String>,
    pub last_result: Option<String>,
}

impl Session {
    /// A fresh session in `creating` state with its initial prompt recorded.
    pub fn new(working_dir: impl Into<String>, model: impl Into<String>, prompt: &str) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            runner_handle: runner_handle_for(&id),
            id,
            working_dir: working_dir.into(),
            model: model.into(),
            status: SessionStatus::Creating,
            created_at: now,
            updated_at: now,
            last_prompt: Some(prompt.to_string()),
            last_result: None,
        }
    }
}

/// Terminal session name for a session id.
pub fn runner_handle_for(session_id: &str) -> String {
    format!("session-{}", session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            SessionStatus::Creating,
            SessionStatus::Active,
            SessionStatus::Idle,
            SessionStatus::Waiting,
            SessionStatus::Ended,
        ] {
            let parsed = SessionStatus::try_from(status.as_str().to_string()).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let err = SessionStatus::try_from("paused".to_string()).unwrap_err();
        assert!(err.to_string().contains("paused"));
    }

    #[test]
    fn test_only_idle_and_waiting_accept_delivery() {
        assert!(SessionStatus::Idle.accepts_delivery());
        assert!(SessionStatus::Waiting.accepts_delivery());
        assert!(!SessionStatus::Active.accepts_delivery());
        assert!(!SessionStatus::Creating.accepts_delivery());
        assert!(!SessionStatus::Ended.accepts_delivery());
    }

    #[test]
    fn test_new_session_derives_runner_handle() {
        let session = Session::new("/tmp", "sonnet", "hello");
        assert_eq!(session.runner_handle, format!("session-{}", session.id));
        assert_eq!(session.status, SessionStatus::Creating);
        assert_eq!(session.last_prompt.as_deref(), Some("hello"));
    }
}
