use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;

use crate::models::OutboxMessage;

const OUTBOX_COLUMNS: &str = "id, session_id, external_message_id, subject, body, status, retry_count, next_retry_at, created_at, sent_at";

pub(crate) async fn create(conn: &mut SqliteConnection, msg: &OutboxMessage) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO outbox (id, session_id, external_message_id, subject, body, status, retry_count, next_retry_at, created_at, sent_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&msg.id)
    .bind(&msg.session_id)
    .bind(&msg.external_message_id)
    .bind(&msg.subject)
    .bind(&msg.body)
    .bind(msg.status.as_str())
    .bind(msg.retry_count)
    .bind(msg.next_retry_at)
    .bind(msg.created_at)
    .bind(msg.sent_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Option<OutboxMessage>, sqlx::Error> {
    sqlx::query_as::<_, OutboxMessage>(&format!(
        "SELECT {} FROM outbox WHERE id = ?",
        OUTBOX_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
}

/// Pending rows that are not scheduled for a later retry, as of `now`.
pub(crate) async fn list_deliverable(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
) -> Result<Vec<OutboxMessage>, sqlx::Error> {
    sqlx::query_as::<_, OutboxMessage>(&format!(
        r#"
        SELECT {} FROM outbox
        WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?)
        ORDER BY created_at ASC, rowid ASC
        "#,
        OUTBOX_COLUMNS
    ))
    .bind(now)
    .fetch_all(&mut *conn)
    .await
}

pub(crate) async fn list_for_session(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> Result<Vec<OutboxMessage>, sqlx::Error> {
    sqlx::query_as::<_, OutboxMessage>(&format!(
        "SELECT {} FROM outbox WHERE session_id = ? ORDER BY created_at ASC, rowid ASC",
        OUTBOX_COLUMNS
    ))
    .bind(session_id)
    .fetch_all(&mut *conn)
    .await
}

pub(crate) async fn mark_sent(conn: &mut SqliteConnection, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE outbox SET status = 'sent', sent_at = ?, next_retry_at = NULL WHERE id = ? AND status = 'pending'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Record a failed send. With `next_retry_at` the row stays pending and is
/// hidden until that instant; without it the row becomes terminally failed.
/// `retry_count` never decreases.
pub(crate) async fn mark_failed(
    conn: &mut SqliteConnection,
    id: &str,
    retry_count: i64,
    next_retry_at: Option<DateTime<Utc>>,
) -> Result<bool, sqlx::Error> {
    let status = if next_retry_at.is_some() { "pending" } else { "failed" };
    let result = sqlx::query(
        r#"
        UPDATE outbox
        SET status = ?, retry_count = MAX(retry_count, ?), next_retry_at = ?
        WHERE id = ? AND status = 'pending'
        "#,
    )
    .bind(status)
    .bind(retry_count)
    .bind(next_retry_at)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Session that an outbound Message-ID belongs to, for reply threading.
pub(crate) async fn session_for_message_id(
    conn: &mut SqliteConnection,
    message_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT session_id FROM outbox WHERE external_message_id = ? LIMIT 1")
        .bind(message_id)
        .fetch_optional(&mut *conn)
        .await
}

/// Delete terminal outbox rows and processed inbox rows of ended sessions
/// older than `retention_days`. Returns `(outbox_deleted, inbox_deleted)`.
pub(crate) async fn purge_old_data(
    conn: &mut SqliteConnection,
    retention_days: u32,
) -> Result<(u64, u64), sqlx::Error> {
    let cutoff = Utc::now() - Duration::days(i64::from(retention_days));

    let outbox = sqlx::query(
        r#"
        DELETE FROM outbox
        WHERE session_id IN (SELECT id FROM sessions WHERE status = 'ended')
          AND status IN ('sent', 'failed')
          AND created_at < ?
        "#,
    )
    .bind(cutoff)
    .execute(&mut *conn)
    .await?;

    let inbox = sqlx::query(
        r#"
        DELETE FROM inbox
        WHERE session_id IN (SELECT id FROM sessions WHERE status = 'ended')
          AND processed = 1
          AND created_at < ?
        "#,
    )
    .bind(cutoff)
    .execute(&mut *conn)
    .await?;

    Ok((outbox.rows_affected(), inbox.rows_affected()))
}
