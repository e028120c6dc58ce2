use crate::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version    INTEGER PRIMARY KEY,
        applied_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id            TEXT PRIMARY KEY,
        runner_handle TEXT NOT NULL UNIQUE,
        working_dir   TEXT NOT NULL,
        model         TEXT NOT NULL,
        status        TEXT NOT NULL CHECK (status IN ('creating', 'active', 'idle', 'waiting', 'ended')),
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL,
        last_prompt   TEXT,
        last_result   TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions (status)",
    r#"
    CREATE TABLE IF NOT EXISTS inbox (
        id         TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions (id),
        body       TEXT NOT NULL,
        created_at TEXT NOT NULL,
        processed  INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_inbox_pending ON inbox (session_id, processed, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        id                  TEXT PRIMARY KEY,
        session_id          TEXT NOT NULL REFERENCES sessions (id),
        external_message_id TEXT,
        subject             TEXT NOT NULL,
        body                TEXT NOT NULL,
        status              TEXT NOT NULL CHECK (status IN ('pending', 'sent', 'failed')),
        retry_count         INTEGER NOT NULL DEFAULT 0,
        next_retry_at       TEXT,
        created_at          TEXT NOT NULL,
        sent_at             TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox (status, next_retry_at)",
    "CREATE INDEX IF NOT EXISTS idx_outbox_message_id ON outbox (external_message_id)",
    r#"
    CREATE TABLE IF NOT EXISTS template (
        id         TEXT PRIMARY KEY,
        message_id TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    )
    "#,
];

fn expand_url(url: &str) -> String {
    match url.strip_prefix("sqlite://") {
        Some(path) => format!("sqlite://{}", shellexpand::tilde(path)),
        None => url.to_string(),
    }
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool, sqlx::Error> {
    let url = expand_url(&config.url);
    let mut options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true);

    if !is_in_memory(&url) {
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    // An in-memory database lives only as long as its connection.
    let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections.max(1));
    if is_in_memory(&url) {
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    pool_options.connect_with(options).await
}

/// Create every table idempotently and stamp the schema version.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    sqlx::query("INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind(chrono::Utc::now())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::debug!(version = SCHEMA_VERSION, "Schema migrated");
    Ok(())
}

pub async fn health_check(pool: &SqlitePool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT sqlite_version()").fetch_one(pool).await?;
    Ok(row.0)
}

pub async fn schema_version(pool: &SqlitePool) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await
}

/// A migrated in-memory pool. Used by tests across the workspace.
pub async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let pool = create_pool(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await?;
    migrate(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let pool = memory_pool().await.unwrap();
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();

        assert_eq!(schema_version(&pool).await.unwrap(), Some(SCHEMA_VERSION));
        let versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[tokio::test]
    async fn test_health_check_reports_sqlite_version() {
        let pool = memory_pool().await.unwrap();
        let version = health_check(&pool).await.unwrap();
        assert!(version.starts_with('3'));
    }

    #[test]
    fn test_expand_url_only_touches_sqlite_paths() {
        assert_eq!(expand_url("sqlite::memory:"), "sqlite::memory:");
        assert!(!expand_url("sqlite://~/postman.db").contains('~'));
    }

    #[tokio::test]
    async fn test_file_pool_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("postman.db");
        let pool = create_pool(&DatabaseConfig {
            url: format!("sqlite://{}", path.display()),
            max_connections: 1,
        })
        .await
        .unwrap();
        migrate(&pool).await.unwrap();
        assert!(path.exists());
    }
}
