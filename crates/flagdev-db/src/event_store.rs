use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use flagdev_core::{
    DebugEvent, DebugSession, DebugSessionsPage, EventStore, EventsPage, Page, StorageError,
};

use crate::schema::{self, EVENT_SCHEMA};
use crate::{db_err, init_pool, json_err};

/// SQLite implementation of EventStore. Kept in its own file so captured
/// traffic never ends up in project backups.
pub struct SqliteEventStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    debug_session_key: String,
    written_at: DateTime<Utc>,
    kind: String,
    data: String,
}

impl TryFrom<EventRow> for DebugEvent {
    type Error = StorageError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(DebugEvent {
            id: row.id,
            session_key: row.debug_session_key,
            written_at: row.written_at,
            kind: row.kind,
            data: serde_json::from_str(&row.data).map_err(json_err)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    key: String,
    written_at: DateTime<Utc>,
    event_count: i64,
}

impl SqliteEventStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let pool = init_pool(path).await?;
        Self::new(pool).await
    }

    pub async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        schema::apply(&pool, EVENT_SCHEMA).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn create_debug_session(&self, key: &str) -> Result<(), StorageError> {
        let result = sqlx::query("INSERT INTO debug_sessions (key, written_at) VALUES (?, ?)")
            .bind(key)
            .bind(Utc::now())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                StorageError::AlreadyExists(format!("debug session {key}")),
            ),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn write_event(
        &self,
        session_key: &str,
        kind: &str,
        data: &Value,
    ) -> Result<(), StorageError> {
        let data = serde_json::to_string(data).map_err(json_err)?;
        let result = sqlx::query(
            r#"
            INSERT INTO debug_events (debug_session_key, written_at, kind, data)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(session_key)
        .bind(Utc::now())
        .bind(kind)
        .bind(data)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => Err(
                StorageError::NotFound(format!("debug session {session_key}")),
            ),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn query_events(
        &self,
        session_key: &str,
        kind: Option<&str>,
        page: Page,
    ) -> Result<EventsPage, StorageError> {
        let total_count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM debug_events
            WHERE debug_session_key = ? AND (? IS NULL OR kind = ?)
            "#,
        )
        .bind(session_key)
        .bind(kind)
        .bind(kind)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, debug_session_key, written_at, kind, data
            FROM debug_events
            WHERE debug_session_key = ? AND (? IS NULL OR kind = ?)
            ORDER BY id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(session_key)
        .bind(kind)
        .bind(kind)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let events = rows
            .into_iter()
            .map(DebugEvent::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let has_more = page.has_more(events.len(), total_count);

        Ok(EventsPage {
            events,
            total_count,
            has_more,
        })
    }

    async fn query_debug_sessions(&self, page: Page) -> Result<DebugSessionsPage, StorageError> {
        let total_count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM debug_sessions s
            WHERE EXISTS (SELECT 1 FROM debug_events e WHERE e.debug_session_key = s.key)
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT s.key, s.written_at, COUNT(e.id) AS event_count
            FROM debug_sessions s
            JOIN debug_events e ON e.debug_session_key = s.key
            GROUP BY s.key
            ORDER BY s.written_at DESC, s.rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let sessions: Vec<DebugSession> = rows
            .into_iter()
            .map(|row| DebugSession {
                key: row.key,
                written_at: row.written_at,
                event_count: row.event_count,
            })
            .collect();
        let has_more = page.has_more(sessions.len(), total_count);

        Ok(DebugSessionsPage {
            sessions,
            total_count,
            has_more,
        })
    }

    async fn delete_debug_session(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM debug_sessions WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_orphan_sessions(&self) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM debug_sessions
            WHERE NOT EXISTS (
                SELECT 1 FROM debug_events e WHERE e.debug_session_key = debug_sessions.key
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!(removed, "Removed empty debug sessions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    async fn setup_store() -> (SqliteEventStore, TempDir) {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("events.db"))
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_create_session_twice() {
        let (store, _dir) = setup_store().await;
        store.create_debug_session("s1").await.unwrap();
        let err = store.create_debug_session("s1").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_write_event_unknown_session() {
        let (store, _dir) = setup_store().await;
        let err = store
            .write_event("missing", "feature", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_query_events_newest_first_with_kind_filter() {
        let (store, _dir) = setup_store().await;
        store.create_debug_session("s1").await.unwrap();
        for i in 0..5 {
            let kind = if i % 2 == 0 { "feature" } else { "custom" };
            store
                .write_event("s1", kind, &json!({ "kind": kind, "n": i }))
                .await
                .unwrap();
        }

        let all = store.query_events("s1", None, Page::new(2, 0)).await.unwrap();
        assert_eq!(all.total_count, 5);
        assert!(all.has_more);
        assert_eq!(all.events[0].data["n"], 4);
        assert_eq!(all.events[1].data["n"], 3);

        let features = store
            .query_events("s1", Some("feature"), Page::new(10, 0))
            .await
            .unwrap();
        assert_eq!(features.total_count, 3);
        assert!(!features.has_more);
        assert!(features.events.iter().all(|e| e.kind == "feature"));

        let tail = store.query_events("s1", None, Page::new(2, 4)).await.unwrap();
        assert_eq!(tail.events.len(), 1);
        assert_eq!(tail.events[0].data["n"], 0);
        assert!(!tail.has_more);
    }

    #[tokio::test]
    async fn test_sessions_listing_skips_empty_sessions() {
        let (store, _dir) = setup_store().await;
        store.create_debug_session("empty").await.unwrap();
        store.create_debug_session("a").await.unwrap();
        store.create_debug_session("b").await.unwrap();
        store.write_event("a", "feature", &json!(1)).await.unwrap();
        store.write_event("b", "feature", &json!(2)).await.unwrap();
        store.write_event("b", "custom", &json!(3)).await.unwrap();

        let page = store.query_debug_sessions(Page::default()).await.unwrap();
        assert_eq!(page.total_count, 2);
        assert!(!page.has_more);
        let keys: Vec<&str> = page.sessions.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(page.sessions[0].event_count, 2);
    }

    #[tokio::test]
    async fn test_delete_session_removes_events() {
        let (store, _dir) = setup_store().await;
        store.create_debug_session("s1").await.unwrap();
        store.write_event("s1", "feature", &json!({})).await.unwrap();

        assert!(store.delete_debug_session("s1").await.unwrap());
        assert!(!store.delete_debug_session("s1").await.unwrap());

        let events = store.query_events("s1", None, Page::default()).await.unwrap();
        assert_eq!(events.total_count, 0);
    }

    #[tokio::test]
    async fn test_delete_orphan_sessions() {
        let (store, _dir) = setup_store().await;
        store.create_debug_session("orphan").await.unwrap();
        store.create_debug_session("kept").await.unwrap();
        store.write_event("kept", "identify", &json!({})).await.unwrap();

        assert_eq!(store.delete_orphan_sessions().await.unwrap(), 1);
        assert_eq!(store.delete_orphan_sessions().await.unwrap(), 0);
        assert!(store.delete_debug_session("kept").await.unwrap());
    }
}
