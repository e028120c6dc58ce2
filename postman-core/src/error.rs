use thiserror::Error;

#[derive(Error, Debug)]
pub enum PostmanError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown {kind} status '{value}'")]
    UnknownStatus { kind: &'static str, value: String },

    #[error("Control socket error: {0}")]
    Ipc(String),
}
