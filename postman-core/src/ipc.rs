//! Control socket protocol
//!
//! Frames are a 4-byte little-endian length prefix followed by a MessagePack
//! map. Requests are tagged by `action`.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PostmanRequest {
    Ping,
    Health,
    /// Sessions that are not ended, oldest first.
    ListSessions,
    GetSession {
        id: String,
    },
    EndSession {
        id: String,
    },
    DeliverNext {
        id: String,
    },
    CreateSession {
        /// Defaults to `$HOME` when absent.
        working_dir: Option<String>,
        /// Defaults to `general.default_model` when absent.
        model: Option<String>,
        prompt: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PostmanResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub version: String,
}

impl PostmanResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
