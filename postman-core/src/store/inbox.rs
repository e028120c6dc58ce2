use sqlx::SqliteConnection;

use crate::models::InboxMessage;

pub(crate) async fn enqueue(conn: &mut SqliteConnection, msg: &InboxMessage) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO inbox (id, session_id, body, created_at, processed) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&msg.id)
    .bind(&msg.session_id)
    .bind(&msg.body)
    .bind(msg.created_at)
    .bind(msg.processed)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Oldest unprocessed message for the session. Same-instant arrivals keep
/// insertion order via `rowid`.
pub(crate) async fn dequeue(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> Result<Option<InboxMessage>, sqlx::Error> {
    sqlx::query_as::<_, InboxMessage>(
        r#"
        SELECT id, session_id, body, created_at, processed
        FROM inbox
        WHERE session_id = ? AND processed = 0
        ORDER BY created_at ASC, rowid ASC
        LIMIT 1
        "#,
    )
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await
}

/// Returns `false` if the message was already processed (or does not exist).
pub(crate) async fn mark_processed(conn: &mut SqliteConnection, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE inbox SET processed = 1 WHERE id = ? AND processed = 0")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn count_pending(conn: &mut SqliteConnection, session_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM inbox WHERE session_id = ? AND processed = 0")
        .bind(session_id)
        .fetch_one(&mut *conn)
        .await
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::db::memory_pool;
    use crate::models::{InboxMessage, Session};
    use crate::store::QueueStore;

    async fn store_with_session() -> (QueueStore, Session) {
        let store = QueueStore::new(memory_pool().await.unwrap());
        let session = Session::new("/work", "sonnet", "p");
        store.create_session(&session).await.unwrap();
        (store, session)
    }

    #[tokio::test]
    async fn test_dequeue_empty_queue_is_none() {
        let (store, session) = store_with_session().await;
        assert!(store.dequeue_inbox(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_returns_oldest_first() {
        let (store, session) = store_with_session().await;
        let base = Utc::now();

        // Enqueued out of order on purpose.
        for (offset, body) in [(2, "third"), (0, "first"), (1, "second")] {
            let mut msg = InboxMessage::new(&session.id, body);
            msg.created_at = base + Duration::seconds(offset);
            store.enqueue_inbox(&msg).await.unwrap();
        }

        let mut seen = Vec::new();
        while let Some(msg) = store.dequeue_inbox(&session.id).await.unwrap() {
            assert!(store.mark_inbox_processed(&msg.id).await.unwrap());
            seen.push(msg);
        }

        let bodies: Vec<&str> = seen.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second", "third"]);
        assert!(seen.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn test_same_instant_keeps_insertion_order() {
        let (store, session) = store_with_session().await;
        let now = Utc::now();
        for body in ["a", "b", "c"] {
            let mut msg = InboxMessage::new(&session.id, body);
            msg.created_at = now;
            store.enqueue_inbox(&msg).await.unwrap();
        }

        let first = store.dequeue_inbox(&session.id).await.unwrap().unwrap();
        assert_eq!(first.body, "a");
    }

    #[tokio::test]
    async fn test_processed_message_is_never_returned_again() {
        let (store, session) = store_with_session().await;
        let msg = InboxMessage::new(&session.id, "only");
        store.enqueue_inbox(&msg).await.unwrap();

        let dequeued = store.dequeue_inbox(&session.id).await.unwrap().unwrap();
        assert_eq!(dequeued.id, msg.id);
        assert!(!dequeued.processed);
        assert!(store.mark_inbox_processed(&msg.id).await.unwrap());

        assert!(store.dequeue_inbox(&session.id).await.unwrap().is_none());
        assert!(
            !store.mark_inbox_processed(&msg.id).await.unwrap(),
            "second mark must be a no-op"
        );
        assert_eq!(store.count_pending_inbox(&session.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queues_are_per_session() {
        let (store, session) = store_with_session().await;
        let other = Session::new("/other", "sonnet", "p");
        store.create_session(&other).await.unwrap();

        store
            .enqueue_inbox(&InboxMessage::new(&other.id, "for other"))
            .await
            .unwrap();

        assert!(store.dequeue_inbox(&session.id).await.unwrap().is_none());
        assert_eq!(store.count_pending_inbox(&other.id).await.unwrap(), 1);
    }
}
