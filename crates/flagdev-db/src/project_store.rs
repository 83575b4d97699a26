use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::backup::{Backup as OnlineBackup, StepResult};
use sqlx::{Connection, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;

use flagdev_core::{
    Backup, Context, FlagVariation, FlagsState, Override, Project, StorageError, Store, Variation,
};

use crate::schema::{self, PROJECT_SCHEMA, PROJECT_TABLES};
use crate::{db_err, init_pool, json_err};

const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";
const BACKUP_PAGES_PER_STEP: i32 = 64;
const BACKUP_RETRY_PAUSE: Duration = Duration::from_millis(25);

/// SQLite implementation of Store.
pub struct SqliteStore {
    pool: SqlitePool,
    path: PathBuf,
    /// Serializes schema setup, backup and restore.
    maintenance: Mutex<()>,
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    key: String,
    source_environment_key: String,
    context: String,
    last_sync_time: DateTime<Utc>,
    flag_state: String,
}

impl ProjectRow {
    fn into_project(self, available_variations: Vec<FlagVariation>) -> Result<Project, StorageError> {
        let context: Context = serde_json::from_str(&self.context).map_err(json_err)?;
        let all_flags_state: FlagsState = serde_json::from_str(&self.flag_state).map_err(json_err)?;
        Ok(Project {
            key: self.key,
            source_environment_key: self.source_environment_key,
            context,
            last_sync_time: self.last_sync_time,
            all_flags_state,
            available_variations,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VariationRow {
    flag_key: String,
    id: String,
    name: Option<String>,
    description: Option<String>,
    value: String,
}

impl TryFrom<VariationRow> for FlagVariation {
    type Error = StorageError;

    fn try_from(row: VariationRow) -> Result<Self, Self::Error> {
        Ok(FlagVariation::new(
            row.flag_key,
            Variation {
                id: row.id,
                name: row.name,
                description: row.description,
                value: serde_json::from_str(&row.value).map_err(json_err)?,
            },
        ))
    }
}

#[derive(sqlx::FromRow)]
struct OverrideRow {
    project_key: String,
    flag_key: String,
    value: String,
    active: bool,
    version: i64,
}

impl TryFrom<OverrideRow> for Override {
    type Error = StorageError;

    fn try_from(row: OverrideRow) -> Result<Self, Self::Error> {
        Ok(Override {
            project_key: row.project_key,
            flag_key: row.flag_key,
            value: serde_json::from_str(&row.value).map_err(json_err)?,
            active: row.active,
            version: row.version,
        })
    }
}

impl SqliteStore {
    /// Open the database file and make sure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let pool = init_pool(path).await?;
        Self::new(pool).await
    }

    pub async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        let path = pool.connect_options().get_filename().to_path_buf();
        let store = Self {
            pool,
            path,
            maintenance: Mutex::new(()),
        };
        {
            let _guard = store.maintenance.lock().await;
            schema::apply(&store.pool, PROJECT_SCHEMA).await?;
        }
        Ok(store)
    }

    async fn variations_for(&self, key: &str) -> Result<Vec<FlagVariation>, StorageError> {
        let rows = sqlx::query_as::<_, VariationRow>(
            r#"
            SELECT flag_key, id, name, description, value
            FROM available_variations
            WHERE project_key = ?
            ORDER BY flag_key, position
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(FlagVariation::try_from).collect()
    }
}

async fn insert_variations(
    conn: &mut SqliteConnection,
    project_key: &str,
    variations: &[FlagVariation],
) -> Result<(), StorageError> {
    for (position, fv) in variations.iter().enumerate() {
        let value = serde_json::to_string(&fv.variation.value).map_err(json_err)?;
        sqlx::query(
            r#"
            INSERT INTO available_variations
                (project_key, flag_key, id, name, description, value, position)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project_key, flag_key, id) DO NOTHING
            "#,
        )
        .bind(project_key)
        .bind(&fv.flag_key)
        .bind(&fv.variation.id)
        .bind(&fv.variation.name)
        .bind(&fv.variation.description)
        .bind(value)
        .bind(position as i64)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

fn encode_project(project: &Project) -> Result<(String, String), StorageError> {
    let context = serde_json::to_string(&project.context).map_err(json_err)?;
    let flag_state = serde_json::to_string(&project.all_flags_state).map_err(json_err)?;
    Ok((context, flag_state))
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_dev_project_keys(&self) -> Result<Vec<String>, StorageError> {
        sqlx::query_scalar("SELECT key FROM projects ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn get_dev_projects(&self) -> Result<Vec<Project>, StorageError> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT key, source_environment_key, context, last_sync_time, flag_state
            FROM projects
            ORDER BY key
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut projects = Vec::with_capacity(rows.len());
        for row in rows {
            let variations = self.variations_for(&row.key).await?;
            projects.push(row.into_project(variations)?);
        }
        Ok(projects)
    }

    async fn get_dev_project(&self, key: &str) -> Result<Project, StorageError> {
        let row = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT key, source_environment_key, context, last_sync_time, flag_state
            FROM projects
            WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StorageError::NotFound(format!("project {key}")))?;

        let variations = self.variations_for(key).await?;
        row.into_project(variations)
    }

    async fn insert_project(&self, project: &Project) -> Result<(), StorageError> {
        let (context, flag_state) = encode_project(project)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO projects (key, source_environment_key, context, last_sync_time, flag_state)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&project.key)
        .bind(&project.source_environment_key)
        .bind(context)
        .bind(project.last_sync_time)
        .bind(flag_state)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StorageError::AlreadyExists(format!(
                    "project {}",
                    project.key
                )));
            }
            Err(e) => return Err(db_err(e)),
        }

        insert_variations(&mut tx, &project.key, &project.available_variations).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn update_project(&self, project: &Project) -> Result<bool, StorageError> {
        let (context, flag_state) = encode_project(project)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(
            r#"
            UPDATE projects
            SET source_environment_key = ?, context = ?, last_sync_time = ?, flag_state = ?
            WHERE key = ?
            "#,
        )
        .bind(&project.source_environment_key)
        .bind(context)
        .bind(project.last_sync_time)
        .bind(flag_state)
        .bind(&project.key)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM available_variations WHERE project_key = ?")
            .bind(&project.key)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        insert_variations(&mut tx, &project.key, &project.available_variations).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn delete_dev_project(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM projects WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_overrides_for_project(&self, key: &str) -> Result<Vec<Override>, StorageError> {
        let rows = sqlx::query_as::<_, OverrideRow>(
            r#"
            SELECT project_key, flag_key, value, active, version
            FROM overrides
            WHERE project_key = ?
            ORDER BY flag_key
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(Override::try_from).collect()
    }

    async fn upsert_override(&self, ovr: &Override) -> Result<Override, StorageError> {
        let value = serde_json::to_string(&ovr.value).map_err(json_err)?;

        // The version is only set on first insert.
        let row = sqlx::query_as::<_, OverrideRow>(
            r#"
            INSERT INTO overrides (project_key, flag_key, value, active, version)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(project_key, flag_key) DO UPDATE
                SET value = excluded.value, active = excluded.active
            RETURNING project_key, flag_key, value, active, version
            "#,
        )
        .bind(&ovr.project_key)
        .bind(&ovr.flag_key)
        .bind(value)
        .bind(ovr.active)
        .bind(ovr.version)
        .fetch_one(&self.pool)
        .await;

        match row {
            Ok(row) => Override::try_from(row),
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => Err(
                StorageError::NotFound(format!("project {}", ovr.project_key)),
            ),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn deactivate_override(
        &self,
        project_key: &str,
        flag_key: &str,
    ) -> Result<i64, StorageError> {
        sqlx::query_scalar(
            r#"
            UPDATE overrides
            SET active = FALSE, version = version + 1
            WHERE project_key = ? AND flag_key = ?
            RETURNING version
            "#,
        )
        .bind(project_key)
        .bind(flag_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StorageError::NotFound(format!("override {project_key}/{flag_key}")))
    }

    async fn get_available_variations_for_project(
        &self,
        key: &str,
    ) -> Result<Vec<FlagVariation>, StorageError> {
        self.variations_for(key).await
    }

    async fn create_backup(&self) -> Result<Backup, StorageError> {
        let _guard = self.maintenance.lock().await;

        let dir = tempfile::tempdir().map_err(|e| StorageError::Database(e.to_string()))?;
        let dest = dir.path().join("backup.db");
        let source = self.path.clone();
        let target = dest.clone();
        tokio::task::spawn_blocking(move || online_backup(&source, &target))
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let bytes = tokio::fs::read(&dest)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        tracing::info!(size = bytes.len(), "Created project store backup");
        Ok(Backup::new(bytes))
    }

    async fn restore_backup(&self, bytes: &[u8]) -> Result<(), StorageError> {
        if !bytes.starts_with(SQLITE_HEADER) {
            return Err(StorageError::InvalidBackup(
                "not a SQLite database".to_string(),
            ));
        }

        let _guard = self.maintenance.lock().await;

        let dir = tempfile::tempdir().map_err(|e| StorageError::Database(e.to_string()))?;
        let path = dir.path().join("restore.db");
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        sqlx::query("ATTACH DATABASE ? AS snapshot")
            .bind(path.to_string_lossy().into_owned())
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;

        let result = copy_from_snapshot(&mut *conn).await;

        if let Err(e) = sqlx::query("DETACH DATABASE snapshot")
            .execute(&mut *conn)
            .await
        {
            tracing::warn!("Failed to detach restore snapshot: {}", e);
        }

        if result.is_ok() {
            tracing::info!(size = bytes.len(), "Restored project store from backup");
        }
        result
    }
}

/// Copy `source` into `dest` page by page with SQLite's online backup.
///
/// Writers on the pool keep going; a step that hits a lock is retried.
fn online_backup(source: &Path, dest: &Path) -> Result<(), rusqlite::Error> {
    let src = rusqlite::Connection::open(source)?;
    src.busy_timeout(Duration::from_secs(5))?;
    let mut dst = rusqlite::Connection::open(dest)?;

    let backup = OnlineBackup::new(&src, &mut dst)?;
    loop {
        match backup.step(BACKUP_PAGES_PER_STEP)? {
            StepResult::Done => break,
            StepResult::More => {}
            _ => std::thread::sleep(BACKUP_RETRY_PAUSE),
        }
    }
    Ok(())
}

/// Replace every project table with the attached snapshot's rows, atomically.
async fn copy_from_snapshot(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    let mut present = 0;
    for table in PROJECT_TABLES {
        let found: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM snapshot.sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| StorageError::InvalidBackup(e.to_string()))?;
        present += found;
    }
    if present != PROJECT_TABLES.len() as i64 {
        return Err(StorageError::InvalidBackup(
            "backup is missing project tables".to_string(),
        ));
    }

    let mut tx = conn.begin().await.map_err(db_err)?;
    for statement in [
        "DELETE FROM overrides",
        "DELETE FROM available_variations",
        "DELETE FROM projects",
        r#"
        INSERT INTO projects (key, source_environment_key, context, last_sync_time, flag_state)
        SELECT key, source_environment_key, context, last_sync_time, flag_state
        FROM snapshot.projects
        "#,
        r#"
        INSERT INTO available_variations
            (project_key, flag_key, id, name, description, value, position)
        SELECT project_key, flag_key, id, name, description, value, position
        FROM snapshot.available_variations
        "#,
        r#"
        INSERT INTO overrides (project_key, flag_key, value, active, version)
        SELECT project_key, flag_key, value, active, version
        FROM snapshot.overrides
        "#,
    ] {
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
    use flagdev_core::FlagState;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    async fn setup_store() -> (SqliteStore, TempDir) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("flagdev.db")).await.unwrap();
        (store, dir)
    }

    fn project(key: &str) -> Project {
        let flags: FlagsState = [
            ("f1".to_string(), FlagState::new(true, 1)),
            ("f2".to_string(), FlagState::new("blue", 4)),
        ]
        .into_iter()
        .collect();
        Project::new(key, "env-1", Context::default(), flags).with_variations(vec![
            FlagVariation::new(
                "f1",
                Variation {
                    id: "on".to_string(),
                    name: Some("On".to_string()),
                    description: None,
                    value: json!(true),
                },
            ),
            FlagVariation::new(
                "f1",
                Variation {
                    id: "off".to_string(),
                    name: None,
                    description: Some("disabled".to_string()),
                    value: json!(false),
                },
            ),
        ])
    }

    #[tokio::test]
    async fn test_insert_and_get_project() {
        let (store, _dir) = setup_store().await;
        let p = project("p1");
        store.insert_project(&p).await.unwrap();

        let loaded = store.get_dev_project("p1").await.unwrap();
        assert_eq!(loaded.source_environment_key, "env-1");
        assert_eq!(loaded.all_flags_state, p.all_flags_state);
        assert_eq!(loaded.context, Context::default());
        assert_eq!(loaded.available_variations, p.available_variations);
        assert_eq!(
            loaded.last_sync_time.timestamp_millis(),
            p.last_sync_time.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_insert_duplicate_fails_and_keeps_state() {
        let (store, _dir) = setup_store().await;
        store.insert_project(&project("p1")).await.unwrap();

        let mut other = project("p1");
        other.source_environment_key = "env-2".to_string();
        let err = store.insert_project(&other).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        let loaded = store.get_dev_project("p1").await.unwrap();
        assert_eq!(loaded.source_environment_key, "env-1");
        assert_eq!(loaded.available_variations.len(), 2);
        assert_eq!(store.get_dev_project_keys().await.unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_get_missing_project() {
        let (store, _dir) = setup_store().await;
        let err = store.get_dev_project("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_project() {
        let (store, _dir) = setup_store().await;
        assert!(!store.update_project(&project("p1")).await.unwrap());

        store.insert_project(&project("p1")).await.unwrap();
        let mut updated = project("p1");
        updated.source_environment_key = "env-2".to_string();
        updated.all_flags_state = updated
            .all_flags_state
            .with_flag("f3", FlagState::new(3, 1));
        updated.available_variations.truncate(1);

        assert!(store.update_project(&updated).await.unwrap());
        let loaded = store.get_dev_project("p1").await.unwrap();
        assert_eq!(loaded.source_environment_key, "env-2");
        assert!(loaded.all_flags_state.contains("f3"));
        assert_eq!(loaded.available_variations.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_project_cascades() {
        let (store, _dir) = setup_store().await;
        store.insert_project(&project("p1")).await.unwrap();
        store
            .upsert_override(&Override::new("p1", "f1", json!(false)))
            .await
            .unwrap();

        assert!(store.delete_dev_project("p1").await.unwrap());
        assert!(!store.delete_dev_project("p1").await.unwrap());
        assert!(store.get_overrides_for_project("p1").await.unwrap().is_empty());
        assert!(store
            .get_available_variations_for_project("p1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_upsert_override_keeps_first_version() {
        let (store, _dir) = setup_store().await;
        store.insert_project(&project("p1")).await.unwrap();

        let first = store
            .upsert_override(&Override::new("p1", "f1", json!(false)))
            .await
            .unwrap();
        assert_eq!(first.version, 1);

        let mut second = Override::new("p1", "f1", json!("other"));
        second.version = 99;
        let stored = store.upsert_override(&second).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.value, json!("other"));
        assert!(stored.active);

        let overrides = store.get_overrides_for_project("p1").await.unwrap();
        assert_eq!(overrides.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_override_for_missing_project() {
        let (store, _dir) = setup_store().await;
        let err = store
            .upsert_override(&Override::new("ghost", "f1", json!(false)))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_deactivate_override() {
        let (store, _dir) = setup_store().await;
        store.insert_project(&project("p1")).await.unwrap();

        let err = store.deactivate_override("p1", "f1").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));

        store
            .upsert_override(&Override::new("p1", "f1", json!(false)))
            .await
            .unwrap();
        assert_eq!(store.deactivate_override("p1", "f1").await.unwrap(), 2);
        assert_eq!(store.deactivate_override("p1", "f1").await.unwrap(), 3);

        let overrides = store.get_overrides_for_project("p1").await.unwrap();
        assert!(!overrides[0].active);
        assert_eq!(overrides[0].value, json!(false));

        // Reactivating keeps the bumped version.
        let stored = store
            .upsert_override(&Override::new("p1", "f1", json!(true)))
            .await
            .unwrap();
        assert!(stored.active);
        assert_eq!(stored.version, 3);
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let (store, _dir) = setup_store().await;
        store.insert_project(&project("p1")).await.unwrap();
        store.insert_project(&project("p2")).await.unwrap();
        store
            .upsert_override(&Override::new("p1", "f2", json!("red")))
            .await
            .unwrap();

        let backup = store.create_backup().await.unwrap();
        assert_eq!(backup.size, backup.bytes.len() as u64);
        assert!(backup.bytes.starts_with(SQLITE_HEADER));

        store.delete_dev_project("p2").await.unwrap();
        store.insert_project(&project("p3")).await.unwrap();
        store.deactivate_override("p1", "f2").await.unwrap();

        store.restore_backup(&backup.bytes).await.unwrap();

        assert_eq!(store.get_dev_project_keys().await.unwrap(), vec!["p1", "p2"]);
        let overrides = store.get_overrides_for_project("p1").await.unwrap();
        assert!(overrides[0].active);
        assert_eq!(overrides[0].version, 1);
        assert_eq!(
            store
                .get_available_variations_for_project("p2")
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_backup_opens_as_standalone_database() {
        let (store, dir) = setup_store().await;
        store.insert_project(&project("p1")).await.unwrap();
        store
            .upsert_override(&Override::new("p1", "f1", json!(false)))
            .await
            .unwrap();

        let backup = store.create_backup().await.unwrap();
        let copy_path = dir.path().join("copy.db");
        std::fs::write(&copy_path, &backup.bytes).unwrap();

        let copy = SqliteStore::open(&copy_path).await.unwrap();
        assert_eq!(copy.get_dev_project_keys().await.unwrap(), vec!["p1"]);
        let overrides = copy.get_overrides_for_project("p1").await.unwrap();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].value, json!(false));
        assert_eq!(
            copy.get_available_variations_for_project("p1")
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_backup_while_writing() {
        let (store, _dir) = setup_store().await;
        let store = std::sync::Arc::new(store);
        store.insert_project(&project("p1")).await.unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    store
                        .upsert_override(&Override::new("p1", "f2", json!(format!("c{i}"))))
                        .await
                        .unwrap();
                }
            })
        };
        let backup = store.create_backup().await.unwrap();
        writer.await.unwrap();

        assert!(backup.bytes.starts_with(SQLITE_HEADER));
        store.restore_backup(&backup.bytes).await.unwrap();
        assert_eq!(store.get_dev_project_keys().await.unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_restore_rejects_garbage() {
        let (store, _dir) = setup_store().await;
        store.insert_project(&project("p1")).await.unwrap();

        let err = store.restore_backup(b"definitely not sqlite").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidBackup(_)));
        assert_eq!(store.get_dev_project_keys().await.unwrap(), vec!["p1"]);
    }
}
