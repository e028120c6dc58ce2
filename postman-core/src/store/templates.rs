use sqlx::SqliteConnection;

use crate::models::TemplateRef;

pub(crate) async fn save(conn: &mut SqliteConnection, template: &TemplateRef) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO template (id, message_id, created_at) VALUES (?, ?, ?)")
        .bind(&template.id)
        .bind(&template.message_id)
        .bind(template.created_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn exists(conn: &mut SqliteConnection, message_id: &str) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM template WHERE message_id = ?")
        .bind(message_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use crate::db::memory_pool;
    use crate::models::TemplateRef;
    use crate::store::QueueStore;

    #[tokio::test]
    async fn test_saved_template_is_recognised() {
        let store = QueueStore::new(memory_pool().await.unwrap());
        let template = TemplateRef::new("<tmpl-1@claude-postman>");
        store.save_template(&template).await.unwrap();

        assert!(store.is_template_ref("<tmpl-1@claude-postman>").await.unwrap());
        assert!(!store.is_template_ref("<other@claude-postman>").await.unwrap());
    }
}
