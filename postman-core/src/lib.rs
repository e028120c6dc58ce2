pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod models;
pub mod store;

pub use config::PostmanConfig;
pub use error::PostmanError;
pub use models::{
    InboxMessage, OutboxMessage, OutboxStatus, Session, SessionStatus, TemplateRef,
};
pub use store::{QueueStore, StoreTx};
