//! Queue Store: durable sessions, inbox and outbox
//!
//! `QueueStore` is a cheap, cloneable handle over the SQLite pool and is the
//! only shared mutable resource in the server. Every multi-step sequence that
//! must stay consistent (dequeue + mark processed + status flip) runs through
//! [`QueueStore::transaction`], which commits on `Ok` and rolls back on `Err`.
//!
//! Each operation is implemented once against a `SqliteConnection` and exposed
//! both on the pool handle and on the transaction handle.

mod inbox;
mod outbox;
mod sessions;
mod templates;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::models::{InboxMessage, OutboxMessage, Session, SessionStatus, TemplateRef};

// ============================================================================
// QueueStore
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueueStore {
    pool: SqlitePool,
}

impl QueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a transaction. Dropping the handle without committing rolls back.
    pub async fn begin(&self) -> Result<StoreTx, sqlx::Error> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    /// Run `work` inside one transaction: commit if it returns `Ok`, roll
    /// back if it returns `Err`.
    ///
    /// Only use the `StoreTx` handed to `work`; calling pool methods from
    /// inside would wait on the connection the transaction holds.
    pub async fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        T: Send,
        E: From<sqlx::Error> + Send,
        F: for<'t> FnOnce(&'t mut StoreTx) -> BoxFuture<'t, Result<T, E>> + Send,
    {
        let mut tx = self.begin().await?;
        match work(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    // --- sessions -----------------------------------------------------------

    pub async fn create_session(&self, session: &Session) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sessions::create(&mut conn, session).await
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sessions::get(&mut conn, id).await
    }

    pub async fn update_session(&self, session: &Session) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sessions::update(&mut conn, session).await
    }

    pub async fn update_session_if(
        &self,
        session: &Session,
        expected: &[SessionStatus],
    ) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sessions::update_if(&mut conn, session, expected).await
    }

    pub async fn list_sessions_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sessions::list_by_status(&mut conn, statuses).await
    }

    // --- inbox --------------------------------------------------------------

    pub async fn enqueue_inbox(&self, msg: &InboxMessage) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        inbox::enqueue(&mut conn, msg).await
    }

    pub async fn dequeue_inbox(&self, session_id: &str) -> Result<Option<InboxMessage>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        inbox::dequeue(&mut conn, session_id).await
    }

    pub async fn mark_inbox_processed(&self, id: &str) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        inbox::mark_processed(&mut conn, id).await
    }

    pub async fn count_pending_inbox(&self, session_id: &str) -> Result<i64, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        inbox::count_pending(&mut conn, session_id).await
    }

    // --- outbox -------------------------------------------------------------

    pub async fn create_outbox(&self, msg: &OutboxMessage) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        outbox::create(&mut conn, msg).await
    }

    pub async fn get_outbox(&self, id: &str) -> Result<Option<OutboxMessage>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        outbox::get(&mut conn, id).await
    }

    pub async fn list_deliverable_outbox(&self) -> Result<Vec<OutboxMessage>, sqlx::Error> {
        self.list_deliverable_outbox_at(Utc::now()).await
    }

    pub async fn list_deliverable_outbox_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        outbox::list_deliverable(&mut conn, now).await
    }

    pub async fn list_outbox_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<OutboxMessage>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        outbox::list_for_session(&mut conn, session_id).await
    }

    pub async fn mark_outbox_sent(&self, id: &str) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        outbox::mark_sent(&mut conn, id).await
    }

    pub async fn mark_outbox_failed(
        &self,
        id: &str,
        retry_count: i64,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        outbox::mark_failed(&mut conn, id, retry_count, next_retry_at).await
    }

    pub async fn session_id_for_message(&self, message_id: &str) -> Result<Option<String>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        outbox::session_for_message_id(&mut conn, message_id).await
    }

    pub async fn purge_old_data(&self, retention_days: u32) -> Result<(u64, u64), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        outbox::purge_old_data(&mut conn, retention_days).await
    }

    // --- templates ----------------------------------------------------------

    pub async fn save_template(&self, template: &TemplateRef) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        templates::save(&mut conn, template).await
    }

    pub async fn is_template_ref(&self, message_id: &str) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        templates::exists(&mut conn, message_id).await
    }
}

// ============================================================================
// StoreTx
// ============================================================================

/// The store operations, bound to one open transaction.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }

    pub async fn create_session(&mut self, session: &Session) -> Result<(), sqlx::Error> {
        sessions::create(&mut self.tx, session).await
    }

    pub async fn get_session(&mut self, id: &str) -> Result<Option<Session>, sqlx::Error> {
        sessions::get(&mut self.tx, id).await
    }

    pub async fn update_session(&mut self, session: &Session) -> Result<bool, sqlx::Error> {
        sessions::update(&mut self.tx, session).await
    }

    pub async fn update_session_if(
        &mut self,
        session: &Session,
        expected: &[SessionStatus],
    ) -> Result<bool, sqlx::Error> {
        sessions::update_if(&mut self.tx, session, expected).await
    }

    pub async fn list_sessions_by_status(
        &mut self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>, sqlx::Error> {
        sessions::list_by_status(&mut self.tx, statuses).await
    }

    pub async fn enqueue_inbox(&mut self, msg: &InboxMessage) -> Result<(), sqlx::Error> {
        inbox::enqueue(&mut self.tx, msg).await
    }

    pub async fn dequeue_inbox(&mut self, session_id: &str) -> Result<Option<InboxMessage>, sqlx::Error> {
        inbox::dequeue(&mut self.tx, session_id).await
    }

    pub async fn mark_inbox_processed(&mut self, id: &str) -> Result<bool, sqlx::Error> {
        inbox::mark_processed(&mut self.tx, id).await
    }

    pub async fn count_pending_inbox(&mut self, session_id: &str) -> Result<i64, sqlx::Error> {
        inbox::count_pending(&mut self.tx, session_id).await
    }

    pub async fn create_outbox(&mut self, msg: &OutboxMessage) -> Result<(), sqlx::Error> {
        outbox::create(&mut self.tx, msg).await
    }

    pub async fn get_outbox(&mut self, id: &str) -> Result<Option<OutboxMessage>, sqlx::Error> {
        outbox::get(&mut self.tx, id).await
    }

    pub async fn list_deliverable_outbox(&mut self) -> Result<Vec<OutboxMessage>, sqlx::Error> {
        outbox::list_deliverable(&mut self.tx, Utc::now()).await
    }

    pub async fn list_outbox_for_session(
        &mut self,
        session_id: &str,
    ) -> Result<Vec<OutboxMessage>, sqlx::Error> {
        outbox::list_for_session(&mut self.tx, session_id).await
    }

    pub async fn mark_outbox_sent(&mut self, id: &str) -> Result<bool, sqlx::Error> {
        outbox::mark_sent(&mut self.tx, id).await
    }

    pub async fn mark_outbox_failed(
        &mut self,
        id: &str,
        retry_count: i64,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, sqlx::Error> {
        outbox::mark_failed(&mut self.tx, id, retry_count, next_retry_at).await
    }

    pub async fn session_id_for_message(&mut self, message_id: &str) -> Result<Option<String>, sqlx::Error> {
        outbox::session_for_message_id(&mut self.tx, message_id).await
    }

    pub async fn purge_old_data(&mut self, retention_days: u32) -> Result<(u64, u64), sqlx::Error> {
        outbox::purge_old_data(&mut self.tx, retention_days).await
    }

    pub async fn save_template(&mut self, template: &TemplateRef) -> Result<(), sqlx::Error> {
        templates::save(&mut self.tx, template).await
    }

    pub async fn is_template_ref(&mut self, message_id: &str) -> Result<bool, sqlx::Error> {
        templates::exists(&mut self.tx, message_id).await
    }
}
