//! flagdev db - SQLite implementations of the storage traits.

pub mod event_store;
pub mod project_store;
pub mod schema;

pub use event_store::SqliteEventStore;
pub use project_store::SqliteStore;

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use flagdev_core::StorageError;

/// Open (creating if missing) a SQLite file with WAL and a busy timeout.
pub async fn init_pool(path: impl AsRef<Path>) -> Result<SqlitePool, StorageError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .synchronous(SqliteSynchronous::Normal);

    SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await
        .map_err(db_err)
}

pub(crate) fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

pub(crate) fn json_err(e: serde_json::Error) -> StorageError {
    StorageError::Database(format!("corrupt JSON column: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_init_pool_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool = init_pool(&path).await.unwrap();

        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one, 1);
        assert!(path.exists());
    }
}
