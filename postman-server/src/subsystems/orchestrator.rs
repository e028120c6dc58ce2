//! Session Orchestrator
//!
//! Owns the session state machine:
//!
//! ```text
//! creating → active → idle ⇄ waiting
//!            active | idle | waiting → ended
//! ```
//!
//! A session is a tmux window running the agent plus a FIFO the agent
//! writes `DONE:<id>` / `ASK:<id>` into. Every step that consumes a queued
//! prompt (dequeue, mark processed, status flip) happens in one store
//! transaction. Keys are typed into the terminal only after it commits, so
//! a prompt is never typed twice.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use postman_core::models::{InboxMessage, OutboxMessage, Session, SessionStatus};
use postman_core::{PostmanConfig, QueueStore};

use super::fifo::{self, FifoSignal};
use super::parse;
use super::terminal::{TerminalError, TerminalRunner};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already ended: {0}")]
    AlreadyEnded(String),

    #[error("session {id} is {status}, not idle or waiting")]
    NotIdle { id: String, status: SessionStatus },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("terminal error: {0}")]
    Terminal(#[from] TerminalError),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub fifo_dir: PathBuf,
    pub agent_command: String,
    pub capture_lines: u32,
    /// Wait after a signal before capturing, so the pane finishes rendering.
    pub settle_delay: Duration,
    pub reattach_live_listeners: bool,
    pub subject_tag: String,
}

impl From<&PostmanConfig> for OrchestratorConfig {
    fn from(config: &PostmanConfig) -> Self {
        Self {
            fifo_dir: PathBuf::from(config.fifo_dir()),
            agent_command: config.session.agent_command.clone(),
            capture_lines: config.session.capture_lines,
            settle_delay: Duration::from_millis(config.session.settle_delay_ms),
            reattach_live_listeners: config.session.reattach_live_listeners,
            subject_tag: config.mail.subject_tag.clone(),
        }
    }
}

/// What a recovery pass did, per session outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub alive: usize,
    pub resumed: usize,
    pub ended: usize,
}

// ============================================================================
// Orchestrator
// ============================================================================

#[derive(Clone)]
pub struct Orchestrator {
    store: QueueStore,
    runner: Arc<dyn TerminalRunner>,
    config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    pub fn new(store: QueueStore, runner: Arc<dyn TerminalRunner>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            runner,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn fifo_path(&self, session_id: &str) -> PathBuf {
        fifo::fifo_path(&self.config.fifo_dir, session_id)
    }

    pub fn prompt_path(&self, session_id: &str) -> PathBuf {
        fifo::prompt_path(&self.config.fifo_dir, session_id)
    }

    // ------------------------------------------------------------------------
    // create / end
    // ------------------------------------------------------------------------

    /// Start a new agent session in `working_dir` with `prompt` as its first
    /// task. On any failure after the row is written the session is ended
    /// and its files removed before the error is returned.
    pub async fn create(&self, working_dir: &str, model: &str, prompt: &str) -> Result<Session, SessionError> {
        validate_model(model)?;
        let working_dir = shellexpand::tilde(working_dir).into_owned();

        let mut session = Session::new(working_dir, model, prompt);
        self.store.create_session(&session).await?;

        match self.launch(&mut session, prompt).await {
            Ok(()) => {
                tracing::info!(
                    session_id = %session.id,
                    working_dir = %session.working_dir,
                    model = %session.model,
                    "Session created"
                );
                Ok(session)
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "Session launch failed");
                self.abandon(&mut session).await;
                Err(e)
            }
        }
    }

    async fn launch(&self, session: &mut Session, prompt: &str) -> Result<(), SessionError> {
        fifo::create_fifo(&self.config.fifo_dir, &session.id)?;
        let prompt_file = fifo::write_prompt_file(&self.config.fifo_dir, &session.id, prompt)?;

        self.runner
            .new_session(&session.runner_handle, &session.working_dir)
            .await?;
        self.runner
            .send_keys(&session.runner_handle, &self.launch_command(session, &prompt_file))
            .await?;

        session.status = SessionStatus::Active;
        if !self
            .store
            .update_session_if(session, &[SessionStatus::Creating])
            .await?
        {
            // A fast DONE already moved it on; keep what the store has.
            tracing::debug!(session_id = %session.id, "Session left creating before launch completed");
        }

        self.spawn_listener(&session.id)?;
        Ok(())
    }

    /// Best-effort teardown of a session that could not be launched or relaunched.
    async fn abandon(&self, session: &mut Session) {
        if self.runner.has_session(&session.runner_handle).await {
            if let Err(e) = self.runner.kill_session(&session.runner_handle).await {
                tracing::warn!(session_id = %session.id, error = %e, "Failed to kill abandoned terminal");
            }
        }
        fifo::write_sentinel(&self.fifo_path(&session.id));
        self.remove_files(&session.id);

        session.status = SessionStatus::Ended;
        if let Err(e) = self.store.update_session(session).await {
            tracing::error!(session_id = %session.id, error = %e, "Failed to mark abandoned session ended");
        }
    }

    /// Stop the agent and retire the session. Terminal and file cleanup is
    /// best effort; the status change is not.
    pub async fn end(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if session.status == SessionStatus::Ended {
            return Err(SessionError::AlreadyEnded(id.to_string()));
        }

        if let Err(e) = self.runner.send_keys(&session.runner_handle, "/exit").await {
            tracing::debug!(session_id = %id, error = %e, "Failed to type /exit");
        }
        if let Err(e) = self.runner.kill_session(&session.runner_handle).await {
            tracing::debug!(session_id = %id, error = %e, "Failed to kill terminal session");
        }
        fifo::write_sentinel(&self.fifo_path(id));
        self.remove_files(id);

        let id_owned = id.to_string();
        self.store
            .transaction(move |tx| {
                Box::pin(async move {
                    let mut fresh = tx
                        .get_session(&id_owned)
                        .await?
                        .ok_or_else(|| SessionError::NotFound(id_owned.clone()))?;
                    if fresh.status == SessionStatus::Ended {
                        return Err(SessionError::AlreadyEnded(id_owned));
                    }
                    fresh.status = SessionStatus::Ended;
                    tx.update_session(&fresh).await?;
                    Ok::<_, SessionError>(())
                })
            })
            .await?;

        tracing::info!(session_id = %id, "Session ended");
        Ok(())
    }

    fn remove_files(&self, id: &str) {
        if let Err(e) = fifo::remove_fifo(&self.config.fifo_dir, id) {
            tracing::warn!(session_id = %id, error = %e, "Failed to remove FIFO");
        }
        if let Err(e) = fifo::remove_prompt_file(&self.config.fifo_dir, id) {
            tracing::warn!(session_id = %id, error = %e, "Failed to remove prompt file");
        }
    }

    // ------------------------------------------------------------------------
    // delivery
    // ------------------------------------------------------------------------

    /// Hand the oldest queued prompt to an idle or waiting session.
    ///
    /// Returns the delivered message, or `None` when the queue is empty. The
    /// message is consumed before it is typed; a failed send is reported but
    /// the message is not re-queued.
    pub async fn deliver_next(&self, id: &str) -> Result<Option<InboxMessage>, SessionError> {
        let id_owned = id.to_string();
        let claimed = self
            .store
            .transaction(move |tx| {
                Box::pin(async move {
                    let mut session = tx
                        .get_session(&id_owned)
                        .await?
                        .ok_or_else(|| SessionError::NotFound(id_owned.clone()))?;
                    if !session.status.accepts_delivery() {
                        return Err(SessionError::NotIdle {
                            id: id_owned,
                            status: session.status,
                        });
                    }

                    let Some(msg) = tx.dequeue_inbox(&id_owned).await? else {
                        return Ok(None);
                    };
                    tx.mark_inbox_processed(&msg.id).await?;

                    session.status = SessionStatus::Active;
                    session.last_prompt = Some(msg.body.clone());
                    tx.update_session_if(&session, &[SessionStatus::Idle, SessionStatus::Waiting])
                        .await?;
                    Ok::<_, SessionError>(Some((session.runner_handle, msg)))
                })
            })
            .await?;

        let Some((handle, msg)) = claimed else {
            return Ok(None);
        };
        self.runner.send_keys(&handle, &msg.body).await?;
        tracing::info!(session_id = %id, inbox_id = %msg.id, "Prompt delivered");
        Ok(Some(msg))
    }

    /// The agent finished a turn: record the pane, queue the result mail,
    /// and either go idle or immediately start the next queued prompt.
    pub async fn handle_done(&self, id: &str) -> Result<(), SessionError> {
        let Some((session, output)) = self.capture_after_signal(id).await? else {
            return Ok(());
        };

        let outbox = OutboxMessage::new(
            id,
            format!("{} Session {} result", self.config.subject_tag, short_id(id)),
            parse::render_output(&output, id),
        );
        let id_owned = session.id.clone();
        let next = self
            .store
            .transaction(move |tx| {
                Box::pin(async move {
                    let mut fresh = tx
                        .get_session(&id_owned)
                        .await?
                        .ok_or_else(|| SessionError::NotFound(id_owned.clone()))?;
                    if fresh.status == SessionStatus::Ended {
                        return Ok(None);
                    }

                    fresh.last_result = Some(output);
                    tx.create_outbox(&outbox).await?;

                    let next = tx.dequeue_inbox(&id_owned).await?;
                    match &next {
                        Some(msg) => {
                            tx.mark_inbox_processed(&msg.id).await?;
                            fresh.status = SessionStatus::Active;
                            fresh.last_prompt = Some(msg.body.clone());
                        }
                        None => fresh.status = SessionStatus::Idle,
                    }
                    tx.update_session(&fresh).await?;
                    Ok::<_, SessionError>(next)
                })
            })
            .await?;

        match next {
            Some(msg) => {
                self.runner.send_keys(&session.runner_handle, &msg.body).await?;
                tracing::info!(session_id = %id, inbox_id = %msg.id, "Turn done, next prompt delivered");
            }
            None => tracing::info!(session_id = %id, "Turn done, session idle"),
        }
        Ok(())
    }

    /// The agent asked a question: mail the pane and wait for a reply.
    pub async fn handle_ask(&self, id: &str) -> Result<(), SessionError> {
        let Some((session, output)) = self.capture_after_signal(id).await? else {
            return Ok(());
        };

        let outbox = OutboxMessage::new(
            id,
            format!("{} Session {} is waiting for your input", self.config.subject_tag, short_id(id)),
            parse::render_output(&output, id),
        );
        let id_owned = session.id.clone();
        self.store
            .transaction(move |tx| {
                Box::pin(async move {
                    let mut fresh = tx
                        .get_session(&id_owned)
                        .await?
                        .ok_or_else(|| SessionError::NotFound(id_owned.clone()))?;
                    if fresh.status == SessionStatus::Ended {
                        return Ok(());
                    }
                    fresh.last_result = Some(output);
                    fresh.status = SessionStatus::Waiting;
                    tx.create_outbox(&outbox).await?;
                    tx.update_session(&fresh).await?;
                    Ok::<_, SessionError>(())
                })
            })
            .await?;

        tracing::info!(session_id = %id, "Session waiting for input");
        Ok(())
    }

    /// Settle, then capture the pane. `None` for sessions already ended.
    async fn capture_after_signal(&self, id: &str) -> Result<Option<(Session, String)>, SessionError> {
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        let session = self.get(id).await?;
        if session.status == SessionStatus::Ended {
            tracing::debug!(session_id = %id, "Signal for ended session ignored");
            return Ok(None);
        }
        let output = self
            .runner
            .capture_pane(&session.runner_handle, self.config.capture_lines)
            .await?;
        Ok(Some((session, output)))
    }

    // ------------------------------------------------------------------------
    // recovery
    // ------------------------------------------------------------------------

    /// Bring every active, idle or waiting session back after a restart.
    /// Sessions whose terminal is gone are relaunched with `--resume`; a
    /// session that cannot be relaunched is ended. Only failing to list the
    /// sessions is an error.
    pub async fn recover_all(&self) -> Result<RecoveryReport, SessionError> {
        let sessions = self
            .store
            .list_sessions_by_status(&SessionStatus::RECOVERABLE)
            .await?;
        let mut report = RecoveryReport::default();

        for mut session in sessions {
            if self.runner.has_session(&session.runner_handle).await {
                report.alive += 1;
                self.reattach(&session);
                continue;
            }

            match self.resume(&session).await {
                Ok(()) => {
                    report.resumed += 1;
                    tracing::info!(session_id = %session.id, "Session resumed");
                }
                Err(e) => {
                    report.ended += 1;
                    tracing::warn!(session_id = %session.id, error = %e, "Session recovery failed, ending it");
                    self.abandon(&mut session).await;
                }
            }
        }

        tracing::info!(
            alive = report.alive,
            resumed = report.resumed,
            ended = report.ended,
            "Recovery pass complete"
        );
        Ok(report)
    }

    fn reattach(&self, session: &Session) {
        if !self.config.reattach_live_listeners {
            tracing::warn!(
                session_id = %session.id,
                "Terminal session still alive; no FIFO listener attached (session.reattach_live_listeners is off)"
            );
            return;
        }
        let attached = fifo::create_fifo(&self.config.fifo_dir, &session.id)
            .and_then(|_| self.spawn_listener(&session.id));
        if let Err(e) = attached {
            tracing::warn!(session_id = %session.id, error = %e, "Failed to reattach listener");
        }
    }

    async fn resume(&self, session: &Session) -> Result<(), SessionError> {
        fifo::create_fifo(&self.config.fifo_dir, &session.id)?;
        self.runner
            .new_session(&session.runner_handle, &session.working_dir)
            .await?;
        self.runner
            .send_keys(&session.runner_handle, &self.resume_command(session))
            .await?;
        self.spawn_listener(&session.id)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------------

    pub async fn get(&self, id: &str) -> Result<Session, SessionError> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Every session that is not ended.
    pub async fn list_active(&self) -> Result<Vec<Session>, SessionError> {
        Ok(self.store.list_sessions_by_status(&SessionStatus::LIVE).await?)
    }

    pub async fn capture_output(&self, id: &str) -> Result<String, SessionError> {
        let session = self.get(id).await?;
        Ok(self
            .runner
            .capture_pane(&session.runner_handle, self.config.capture_lines)
            .await?)
    }

    // ------------------------------------------------------------------------
    // commands and listener
    // ------------------------------------------------------------------------

    pub fn launch_command(&self, session: &Session, prompt_file: &Path) -> String {
        format!(
            "{} --dangerously-skip-permissions --session-id {} --system-prompt '{}' --model {} \"$(cat \"{}\")\"",
            self.config.agent_command,
            session.id,
            self.system_instruction(&session.id),
            session.model,
            prompt_file.display()
        )
    }

    pub fn resume_command(&self, session: &Session) -> String {
        format!(
            "{} --dangerously-skip-permissions --resume {} --model {}",
            self.config.agent_command, session.id, session.model
        )
    }

    /// Instruction appended to the agent's system prompt. It is embedded in
    /// single quotes, so it must not contain any; the FIFO path is
    /// double-quoted for the agent's shell.
    pub fn system_instruction(&self, id: &str) -> String {
        let fifo = self.fifo_path(id);
        let fifo = fifo.display();
        format!(
            "When you finish a task you MUST run: echo \"DONE:{id}\" > \"{fifo}\" \
             Before asking the user a question or for a choice you MUST first run: echo \"ASK:{id}\" > \"{fifo}\" \
             and then wait for the answer. \
             Your final answer must include a summary of what you did, the result, and the list of changed files if any. \
             Finish the task by any means necessary. Make at least ten attempts before giving up.",
            id = id,
            fifo = fifo
        )
    }

    /// Read `<id>.fifo` on a dedicated thread and dispatch its signals on
    /// the runtime. The listener ends on `SHUTDOWN` or when the FIFO goes
    /// away.
    pub fn spawn_listener(&self, id: &str) -> std::io::Result<()> {
        let mut signals = fifo::spawn_reader(self.fifo_path(id), id)?;
        let orchestrator = self.clone();
        let id = id.to_string();

        tokio::spawn(async move {
            tracing::debug!(session_id = %id, "FIFO listener started");
            while let Some(signal) = signals.recv().await {
                match signal {
                    FifoSignal::Done(signalled) => {
                        warn_on_mismatch(&id, &signalled);
                        if let Err(e) = orchestrator.handle_done(&id).await {
                            tracing::error!(session_id = %id, error = %e, "DONE handling failed");
                        }
                    }
                    FifoSignal::Ask(signalled) => {
                        warn_on_mismatch(&id, &signalled);
                        if let Err(e) = orchestrator.handle_ask(&id).await {
                            tracing::error!(session_id = %id, error = %e, "ASK handling failed");
                        }
                    }
                    FifoSignal::Shutdown => break,
                    FifoSignal::Unknown(line) => {
                        tracing::warn!(session_id = %id, line = %line, "Unknown FIFO signal");
                    }
                }
            }
            tracing::debug!(session_id = %id, "FIFO listener exited");
        });

        Ok(())
    }
}

fn warn_on_mismatch(expected: &str, signalled: &str) {
    if !signalled.is_empty() && signalled != expected {
        tracing::warn!(session_id = %expected, signalled = %signalled, "FIFO signal carries another session id");
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Model tags are typed into a shell, so only plain identifiers pass.
fn validate_model(model: &str) -> Result<(), SessionError> {
    let valid = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:\-\[\]]*$")
        .map(|re| re.is_match(model))
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidArgument(format!("invalid model '{}'", model)))
    }
}

// ============================================================================
// TESTS
// ============================================================================
