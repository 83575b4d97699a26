use async_trait::async_trait;
use serde_json::Value;

use crate::debug::{DebugSessionsPage, EventsPage, Page};
use crate::error::StorageError;
use crate::flag_override::Override;
use crate::project::Project;
use crate::variation::FlagVariation;

/// A point-in-time copy of the project store.
#[derive(Debug, Clone)]
pub struct Backup {
    pub bytes: Vec<u8>,
    pub size: u64,
}

impl Backup {
    pub fn new(bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self { bytes, size }
    }
}

/// Persistence for projects, their variations and overrides.
#[async_trait]
pub trait Store: Send + Sync {
    /// All project keys, sorted.
    async fn get_dev_project_keys(&self) -> Result<Vec<String>, StorageError>;

    /// All projects, sorted by key.
    async fn get_dev_projects(&self) -> Result<Vec<Project>, StorageError>;

    /// Fails with `NotFound` if the key is unknown.
    async fn get_dev_project(&self, key: &str) -> Result<Project, StorageError>;

    /// Fails with `AlreadyExists` if the key is taken; the store is left
    /// unchanged in that case.
    async fn insert_project(&self, project: &Project) -> Result<(), StorageError>;

    /// Replace the synced fields of an existing project.
    /// Returns Ok(false) if no project has this key.
    async fn update_project(&self, project: &Project) -> Result<bool, StorageError>;

    /// Returns whether a project was deleted.
    async fn delete_dev_project(&self, key: &str) -> Result<bool, StorageError>;

    async fn get_overrides_for_project(&self, key: &str) -> Result<Vec<Override>, StorageError>;

    /// Insert or update by (project, flag). Updates change value and active
    /// state only; the stored override is returned.
    async fn upsert_override(&self, ovr: &Override) -> Result<Override, StorageError>;

    /// Deactivate and bump the version. Returns the new version.
    async fn deactivate_override(
        &self,
        project_key: &str,
        flag_key: &str,
    ) -> Result<i64, StorageError>;

    async fn get_available_variations_for_project(
        &self,
        key: &str,
    ) -> Result<Vec<FlagVariation>, StorageError>;

    async fn create_backup(&self) -> Result<Backup, StorageError>;

    /// Replace the whole store with the contents of a backup.
    async fn restore_backup(&self, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Persistence for debug sessions and the SDK events captured in them.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn create_debug_session(&self, key: &str) -> Result<(), StorageError>;

    async fn write_event(
        &self,
        session_key: &str,
        kind: &str,
        data: &Value,
    ) -> Result<(), StorageError>;

    /// Newest first.
    async fn query_events(
        &self,
        session_key: &str,
        kind: Option<&str>,
        page: Page,
    ) -> Result<EventsPage, StorageError>;

    /// Sessions with at least one event, newest first.
    async fn query_debug_sessions(&self, page: Page) -> Result<DebugSessionsPage, StorageError>;

    /// Deletes the session and its events. Returns whether it existed.
    async fn delete_debug_session(&self, key: &str) -> Result<bool, StorageError>;

    /// Delete sessions without events. Returns how many were removed.
    async fn delete_orphan_sessions(&self) -> Result<u64, StorageError>;
}

// In-memory implementations for testing
#[cfg(any(test, feature = "test-utils"))]
pub mod memory {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::RwLock;

    use chrono::Utc;

    use crate::debug::{DebugEvent, DebugSession};

    #[derive(Default, Clone)]
    struct Tables {
        projects: BTreeMap<String, Project>,
        overrides: BTreeMap<(String, String), Override>,
    }

    /// In-memory project store for testing.
    #[derive(Default)]
    pub struct InMemoryStore {
        tables: RwLock<Tables>,
    }

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Store for InMemoryStore {
        async fn get_dev_project_keys(&self) -> Result<Vec<String>, StorageError> {
            Ok(self.tables.read().unwrap().projects.keys().cloned().collect())
        }

        async fn get_dev_projects(&self) -> Result<Vec<Project>, StorageError> {
            Ok(self
                .tables
                .read()
                .unwrap()
                .projects
                .values()
                .cloned()
                .collect())
        }

        async fn get_dev_project(&self, key: &str) -> Result<Project, StorageError> {
            self.tables
                .read()
                .unwrap()
                .projects
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(format!("project {key}")))
        }

        async fn insert_project(&self, project: &Project) -> Result<(), StorageError> {
            let mut tables = self.tables.write().unwrap();
            if tables.projects.contains_key(&project.key) {
                return Err(StorageError::AlreadyExists(format!(
                    "project {}",
                    project.key
                )));
            }
            tables.projects.insert(project.key.clone(), project.clone());
            Ok(())
        }

        async fn update_project(&self, project: &Project) -> Result<bool, StorageError> {
            let mut tables = self.tables.write().unwrap();
            match tables.projects.get_mut(&project.key) {
                Some(existing) => {
                    *existing = project.clone();
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn delete_dev_project(&self, key: &str) -> Result<bool, StorageError> {
            let mut tables = self.tables.write().unwrap();
            tables.overrides.retain(|(project, _), _| project != key);
            Ok(tables.projects.remove(key).is_some())
        }

        async fn get_overrides_for_project(
            &self,
            key: &str,
        ) -> Result<Vec<Override>, StorageError> {
            Ok(self
                .tables
                .read()
                .unwrap()
                .overrides
                .values()
                .filter(|o| o.project_key == key)
                .cloned()
                .collect())
        }

        async fn upsert_override(&self, ovr: &Override) -> Result<Override, StorageError> {
            let mut tables = self.tables.write().unwrap();
            if !tables.projects.contains_key(&ovr.project_key) {
                return Err(StorageError::NotFound(format!(
                    "project {}",
                    ovr.project_key
                )));
            }
            let stored = tables
                .overrides
                .entry((ovr.project_key.clone(), ovr.flag_key.clone()))
                .and_modify(|existing| {
                    existing.value = ovr.value.clone();
                    existing.active = ovr.active;
                })
                .or_insert_with(|| ovr.clone());
            Ok(stored.clone())
        }

        async fn deactivate_override(
            &self,
            project_key: &str,
            flag_key: &str,
        ) -> Result<i64, StorageError> {
            let mut tables = self.tables.write().unwrap();
            let ovr = tables
                .overrides
                .get_mut(&(project_key.to_string(), flag_key.to_string()))
                .ok_or_else(|| {
                    StorageError::NotFound(format!("override {project_key}/{flag_key}"))
                })?;
            ovr.active = false;
            ovr.version += 1;
            Ok(ovr.version)
        }

        async fn get_available_variations_for_project(
            &self,
            key: &str,
        ) -> Result<Vec<FlagVariation>, StorageError> {
            Ok(self
                .tables
                .read()
                .unwrap()
                .projects
                .get(key)
                .map(|p| p.available_variations.clone())
                .unwrap_or_default())
        }

        async fn create_backup(&self) -> Result<Backup, StorageError> {
            let tables = self.tables.read().unwrap().clone();
            let projects: Vec<Project> = tables.projects.into_values().collect();
            let overrides: Vec<Override> = tables.overrides.into_values().collect();
            let bytes = serde_json::to_vec(&(projects, overrides))
                .map_err(|e| StorageError::Database(e.to_string()))?;
            Ok(Backup::new(bytes))
        }

        async fn restore_backup(&self, bytes: &[u8]) -> Result<(), StorageError> {
            let (projects, overrides): (Vec<Project>, Vec<Override>) =
                serde_json::from_slice(bytes)
                    .map_err(|e| StorageError::Database(e.to_string()))?;
            let mut tables = self.tables.write().unwrap();
            tables.projects = projects.into_iter().map(|p| (p.key.clone(), p)).collect();
            tables.overrides = overrides
                .into_iter()
                .map(|o| ((o.project_key.clone(), o.flag_key.clone()), o))
                .collect();
            Ok(())
        }
    }

    /// In-memory debug event store for testing.
    #[derive(Default)]
    pub struct InMemoryEventStore {
        sessions: RwLock<BTreeMap<String, chrono::DateTime<Utc>>>,
        events: RwLock<Vec<DebugEvent>>,
    }

    impl InMemoryEventStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl EventStore for InMemoryEventStore {
        async fn create_debug_session(&self, key: &str) -> Result<(), StorageError> {
            let mut sessions = self.sessions.write().unwrap();
            if sessions.contains_key(key) {
                return Err(StorageError::AlreadyExists(format!("debug session {key}")));
            }
            sessions.insert(key.to_string(), Utc::now());
            Ok(())
        }

        async fn write_event(
            &self,
            session_key: &str,
            kind: &str,
            data: &Value,
        ) -> Result<(), StorageError> {
            if !self.sessions.read().unwrap().contains_key(session_key) {
                return Err(StorageError::NotFound(format!(
                    "debug session {session_key}"
                )));
            }
            let mut events = self.events.write().unwrap();
            let id = events.len() as i64 + 1;
            events.push(DebugEvent {
                id,
                session_key: session_key.to_string(),
                written_at: Utc::now(),
                kind: kind.to_string(),
                data: data.clone(),
            });
            Ok(())
        }

        async fn query_events(
            &self,
            session_key: &str,
            kind: Option<&str>,
            page: Page,
        ) -> Result<EventsPage, StorageError> {
            let events = self.events.read().unwrap();
            let matching: Vec<&DebugEvent> = events
                .iter()
                .rev()
                .filter(|e| e.session_key == session_key)
                .filter(|e| kind.is_none_or(|k| e.kind == k))
                .collect();
            let total_count = matching.len() as i64;
            let events: Vec<DebugEvent> = matching
                .into_iter()
                .skip(page.offset as usize)
                .take(page.limit as usize)
                .cloned()
                .collect();
            let has_more = page.has_more(events.len(), total_count);
            Ok(EventsPage {
                events,
                total_count,
                has_more,
            })
        }

        async fn query_debug_sessions(
            &self,
            page: Page,
        ) -> Result<DebugSessionsPage, StorageError> {
            let sessions = self.sessions.read().unwrap();
            let events = self.events.read().unwrap();
            let mut with_events: Vec<DebugSession> = sessions
                .iter()
                .map(|(key, written_at)| DebugSession {
                    key: key.clone(),
                    written_at: *written_at,
                    event_count: events.iter().filter(|e| &e.session_key == key).count() as i64,
                })
                .filter(|s| s.event_count > 0)
                .collect();
            with_events.sort_by(|a, b| b.written_at.cmp(&a.written_at));

            let total_count = with_events.len() as i64;
            let sessions: Vec<DebugSession> = with_events
                .into_iter()
                .skip(page.offset as usize)
                .take(page.limit as usize)
                .collect();
            let has_more = page.has_more(sessions.len(), total_count);
            Ok(DebugSessionsPage {
                sessions,
                total_count,
                has_more,
            })
        }

        async fn delete_debug_session(&self, key: &str) -> Result<bool, StorageError> {
            let removed = self.sessions.write().unwrap().remove(key).is_some();
            self.events
                .write()
                .unwrap()
                .retain(|e| e.session_key != key);
            Ok(removed)
        }

        async fn delete_orphan_sessions(&self) -> Result<u64, StorageError> {
            let events = self.events.read().unwrap();
            let mut sessions = self.sessions.write().unwrap();
            let before = sessions.len();
            sessions.retain(|key, _| events.iter().any(|e| &e.session_key == key));
            Ok((before - sessions.len()) as u64)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::context::Context;
        use crate::flags::{FlagState, FlagsState};
        use serde_json::json;

        fn project(key: &str) -> Project {
            let flags: FlagsState = [("f1".to_string(), FlagState::new(true, 1))]
                .into_iter()
                .collect();
            Project::new(key, "env", Context::default(), flags)
        }

        #[tokio::test]
        async fn test_insert_is_not_idempotent() {
            let store = InMemoryStore::new();
            store.insert_project(&project("p1")).await.unwrap();

            let err = store.insert_project(&project("p1")).await.unwrap_err();
            assert!(matches!(err, StorageError::AlreadyExists(_)));
            assert_eq!(store.get_dev_project_keys().await.unwrap(), vec!["p1"]);
        }

        #[tokio::test]
        async fn test_upsert_keeps_version_and_deactivate_bumps_it() {
            let store = InMemoryStore::new();
            store.insert_project(&project("p1")).await.unwrap();

            store
                .upsert_override(&Override::new("p1", "f1", json!(false)))
                .await
                .unwrap();
            let mut again = Override::new("p1", "f1", json!("x"));
            again.version = 40;
            let stored = store.upsert_override(&again).await.unwrap();
            assert_eq!(stored.version, 1);
            assert_eq!(stored.value, json!("x"));

            assert_eq!(store.deactivate_override("p1", "f1").await.unwrap(), 2);
            assert_eq!(store.deactivate_override("p1", "f1").await.unwrap(), 3);
        }

        #[tokio::test]
        async fn test_event_store_orphans() {
            let store = InMemoryEventStore::new();
            store.create_debug_session("empty").await.unwrap();
            store.create_debug_session("full").await.unwrap();
            store
                .write_event("full", "feature", &json!({"kind": "feature"}))
                .await
                .unwrap();

            assert_eq!(store.delete_orphan_sessions().await.unwrap(), 1);
            let page = store.query_debug_sessions(Page::default()).await.unwrap();
            assert_eq!(page.total_count, 1);
            assert_eq!(page.sessions[0].key, "full");
        }
    }
}
