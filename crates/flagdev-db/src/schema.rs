use sqlx::SqlitePool;

use flagdev_core::StorageError;

use crate::db_err;

/// Project store tables. Flag state and contexts are JSON text.
pub const PROJECT_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        key TEXT PRIMARY KEY,
        source_environment_key TEXT NOT NULL,
        context TEXT NOT NULL,
        last_sync_time TIMESTAMP NOT NULL,
        flag_state TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS available_variations (
        project_key TEXT NOT NULL REFERENCES projects(key) ON DELETE CASCADE,
        flag_key TEXT NOT NULL,
        id TEXT NOT NULL,
        name TEXT,
        description TEXT,
        value TEXT NOT NULL,
        position INTEGER NOT NULL,
        UNIQUE (project_key, flag_key, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS overrides (
        project_key TEXT NOT NULL REFERENCES projects(key) ON DELETE CASCADE,
        flag_key TEXT NOT NULL,
        value TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        version INTEGER NOT NULL DEFAULT 1,
        UNIQUE (project_key, flag_key)
    )
    "#,
];

/// Tables a backup must contain to be restorable.
pub const PROJECT_TABLES: &[&str] = &["projects", "available_variations", "overrides"];

/// Debug capture tables.
pub const EVENT_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS debug_sessions (
        key TEXT PRIMARY KEY,
        written_at TIMESTAMP NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS debug_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        debug_session_key TEXT NOT NULL REFERENCES debug_sessions(key) ON DELETE CASCADE,
        written_at TIMESTAMP NOT NULL,
        kind TEXT NOT NULL,
        data TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS debug_events_by_session ON debug_events (debug_session_key, id)",
];

/// Apply a schema in one transaction. Safe to run on every start.
pub async fn apply(pool: &SqlitePool, statements: &[&str]) -> Result<(), StorageError> {
    let mut tx = pool.begin().await.map_err(db_err)?;
    for statement in statements {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
    }
    tx.commit().await.map_err(db_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_pool;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let dir = tempdir().unwrap();
        let pool = init_pool(dir.path().join("schema.db")).await.unwrap();

        apply(&pool, PROJECT_SCHEMA).await.unwrap();
        apply(&pool, PROJECT_SCHEMA).await.unwrap();
        apply(&pool, EVENT_SCHEMA).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 5);
    }
}
