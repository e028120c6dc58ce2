use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::PostmanError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PostmanConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/claude-postman/control.sock".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    /// Kept at 1 so every transaction is serialised by the pool itself.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://~/.claude-postman/claude-postman.db".to_string(),
            max_connections: 1,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub default_model: String,
    pub poll_interval_secs: u64,
    pub flush_interval_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_model: "sonnet".to_string(),
            poll_interval_secs: 30,
            flush_interval_secs: 30,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub fifo_dir: String,
    pub agent_command: String,
    pub capture_lines: u32,
    pub settle_delay_ms: u64,
    /// Start FIFO listeners for sessions whose terminal survived a restart.
    pub reattach_live_listeners: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fifo_dir: "/tmp/claude-postman".to_string(),
            agent_command: "claude".to_string(),
            capture_lines: 1000,
            settle_delay_ms: 500,
            reattach_live_listeners: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TerminalConfig {
    pub tmux_binary: String,
    pub command_timeout_secs: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            tmux_binary: "tmux".to_string(),
            command_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MailConfig {
    /// The only sender accepted, and the recipient of every outbound mail.
    pub user: String,
    pub gateway_url: String,
    pub password: Option<String>,
    pub subject_tag: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            gateway_url: String::new(),
            password: None,
            subject_tag: "[claude-postman]".to_string(),
            request_timeout_secs: 30,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    pub days: u32,
    pub interval_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 30,
            interval_hours: 24,
        }
    }
}

impl PostmanConfig {
    /// Load `path` (TOML), then overlay `POSTMAN__SECTION__KEY` environment variables.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("POSTMAN").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    /// Reject configs the server cannot run with.
    pub fn validate(&self) -> Result<(), PostmanError> {
        if self.mail.user.trim().is_empty() {
            return Err(PostmanError::InvalidConfig("mail.user is required".into()));
        }
        if self.mail.gateway_url.trim().is_empty() {
            return Err(PostmanError::InvalidConfig(
                "mail.gateway_url is required".into(),
            ));
        }
        if self.general.poll_interval_secs == 0
            || self.general.flush_interval_secs == 0
            || self.general.sweep_interval_secs == 0
        {
            return Err(PostmanError::InvalidConfig(
                "loop intervals must be greater than zero".into(),
            ));
        }
        // The FIFO path is typed into a shell inside quotes.
        if self
            .session
            .fifo_dir
            .chars()
            .any(|c| matches!(c, '\'' | '"' | '$' | '`' | '\\' | '\n' | '\r'))
        {
            return Err(PostmanError::InvalidConfig(
                "session.fifo_dir must not contain quotes, $, backticks, backslashes or newlines".into(),
            ));
        }
        if self.mail.max_retries == 0 {
            return Err(PostmanError::InvalidConfig(
                "mail.max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// FIFO directory with `~` expanded.
    pub fn fifo_dir(&self) -> String {
        shellexpand::tilde(&self.session.fifo_dir).into_owned()
    }
}
