use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::models::{Session, SessionStatus};

const SESSION_COLUMNS: &str = "id, runner_handle, working_dir, model, status, created_at, updated_at, last_prompt, last_result";

pub(crate) async fn create(conn: &mut SqliteConnection, session: &Session) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO sessions (id, runner_handle, working_dir, model, status, created_at, updated_at, last_prompt, last_result)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(&session.runner_handle)
    .bind(&session.working_dir)
    .bind(&session.model)
    .bind(session.status.as_str())
    .bind(session.created_at)
    .bind(session.updated_at)
    .bind(&session.last_prompt)
    .bind(&session.last_result)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>(&format!(
        "SELECT {} FROM sessions WHERE id = ?",
        SESSION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
}

/// Writes the mutable columns. `id` and `runner_handle` never change.
pub(crate) async fn update(conn: &mut SqliteConnection, session: &Session) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET working_dir = ?, model = ?, status = ?, updated_at = ?, last_prompt = ?, last_result = ?
        WHERE id = ?
        "#,
    )
    .bind(&session.working_dir)
    .bind(&session.model)
    .bind(session.status.as_str())
    .bind(Utc::now())
    .bind(&session.last_prompt)
    .bind(&session.last_result)
    .bind(&session.id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Like [`update`], but only while the stored status is one of `expected`.
/// Returns `false` when another writer moved the session first.
pub(crate) async fn update_if(
    conn: &mut SqliteConnection,
    session: &Session,
    expected: &[SessionStatus],
) -> Result<bool, sqlx::Error> {
    if expected.is_empty() {
        return Ok(false);
    }

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE sessions SET working_dir = ");
    qb.push_bind(&session.working_dir)
        .push(", model = ")
        .push_bind(&session.model)
        .push(", status = ")
        .push_bind(session.status.as_str())
        .push(", updated_at = ")
        .push_bind(Utc::now())
        .push(", last_prompt = ")
        .push_bind(&session.last_prompt)
        .push(", last_result = ")
        .push_bind(&session.last_result)
        .push(" WHERE id = ")
        .push_bind(&session.id)
        .push(" AND status IN (");
    let mut statuses = qb.separated(", ");
    for status in expected {
        statuses.push_bind(status.as_str());
    }
    statuses.push_unseparated(")");

    let result = qb.build().execute(&mut *conn).await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn list_by_status(
    conn: &mut SqliteConnection,
    statuses: &[SessionStatus],
) -> Result<Vec<Session>, sqlx::Error> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {} FROM sessions WHERE status IN (",
        SESSION_COLUMNS
    ));
    let mut separated = qb.separated(", ");
    for status in statuses {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(") ORDER BY created_at ASC");

    qb.build_query_as::<Session>().fetch_all(&mut *conn).await
}

#[cfg(test)]
mod tests {
    use crate::db::memory_pool;
    use crate::models::{Session, SessionStatus};
    use crate::store::QueueStore;

    #[tokio::test]
    async fn test_create_and_get_session() {
        let store = QueueStore::new(memory_pool().await.unwrap());
        let session = Session::new("/work", "opus", "first prompt");
        store.create_session(&session).await.unwrap();

        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.runner_handle, session.runner_handle);
        assert_eq!(loaded.working_dir, "/work");
        assert_eq!(loaded.model, "opus");
        assert_eq!(loaded.status, SessionStatus::Creating);
        assert_eq!(loaded.last_prompt.as_deref(), Some("first prompt"));
        assert!(loaded.last_result.is_none());
    }

    #[tokio::test]
    async fn test_get_unknown_session_is_none() {
        let store = QueueStore::new(memory_pool().await.unwrap());
        assert!(store.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_session_bumps_updated_at() {
        let store = QueueStore::new(memory_pool().await.unwrap());
        let mut session = Session::new("/work", "sonnet", "p");
        store.create_session(&session).await.unwrap();

        session.status = SessionStatus::Idle;
        session.last_result = Some("output".into());
        assert!(store.update_session(&session).await.unwrap());

        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Idle);
        assert_eq!(loaded.last_result.as_deref(), Some("output"));
        assert!(loaded.updated_at >= session.updated_at);
    }

    #[tokio::test]
    async fn test_update_if_respects_expected_status() {
        let store = QueueStore::new(memory_pool().await.unwrap());
        let mut session = Session::new("/work", "sonnet", "p");
        session.status = SessionStatus::Active;
        store.create_session(&session).await.unwrap();

        session.status = SessionStatus::Active;
        let moved = store
            .update_session_if(&session, &[SessionStatus::Idle, SessionStatus::Waiting])
            .await
            .unwrap();
        assert!(!moved, "active session must not match idle|waiting");

        session.status = SessionStatus::Idle;
        let moved = store
            .update_session_if(&session, &[SessionStatus::Active])
            .await
            .unwrap();
        assert!(moved);
        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_list_sessions_by_status() {
        let store = QueueStore::new(memory_pool().await.unwrap());
        for status in [
            SessionStatus::Active,
            SessionStatus::Idle,
            SessionStatus::Waiting,
            SessionStatus::Ended,
        ] {
            let mut session = Session::new("/work", "sonnet", "p");
            session.status = status;
            store.create_session(&session).await.unwrap();
        }

        let idle_or_waiting = store
            .list_sessions_by_status(&[SessionStatus::Idle, SessionStatus::Waiting])
            .await
            .unwrap();
        assert_eq!(idle_or_waiting.len(), 2);
        assert!(idle_or_waiting.iter().all(|s| s.status.accepts_delivery()));

        let none = store.list_sessions_by_status(&[]).await.unwrap();
        assert!(none.is_empty());
    }
}
