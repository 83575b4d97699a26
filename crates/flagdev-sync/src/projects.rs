use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::sleep;

use flagdev_core::variation::flatten;
use flagdev_core::{
    Backup, Context, CoreError, FlagState, FlagVariation, FlagsState, ObserverEvent, Observers,
    Override, OverrideEvent, Project, Store, SyncEvent, ValidationError,
};

use crate::export::ProjectExport;
use crate::protocol::{self, Environment};
use crate::remote::{EvaluationSdk, ManagementApi};

/// Statistics from one pass over every stored project.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub projects_synced: usize,
    pub projects_failed: usize,
}

/// Orchestrates upstream fetches, store writes and change notifications.
pub struct ProjectService {
    store: Arc<dyn Store>,
    observers: Arc<Observers>,
    api: Arc<dyn ManagementApi>,
    sdk: Arc<dyn EvaluationSdk>,
}

impl ProjectService {
    pub fn new(
        store: Arc<dyn Store>,
        observers: Arc<Observers>,
        api: Arc<dyn ManagementApi>,
        sdk: Arc<dyn EvaluationSdk>,
    ) -> Self {
        Self {
            store,
            observers,
            api,
            sdk,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn observers(&self) -> &Arc<Observers> {
        &self.observers
    }

    /// Fetch flag values and variation metadata. Nothing is written.
    async fn fetch(
        &self,
        project_key: &str,
        source_environment_key: &str,
        context: &Context,
    ) -> Result<(FlagsState, Vec<FlagVariation>), CoreError> {
        let sdk_key = self
            .api
            .get_sdk_key(project_key, source_environment_key)
            .await?;
        let flags = self.sdk.get_all_flags_state(context, &sdk_key).await?;
        let remote_flags = self.api.get_all_flags(project_key).await?;
        Ok((flags, protocol::variations_of(&remote_flags)))
    }

    /// Sync a new project from upstream. The store is only written once
    /// every upstream call has succeeded.
    pub async fn create_project(
        &self,
        key: &str,
        source_environment_key: &str,
        context: Option<Context>,
    ) -> Result<Project, CoreError> {
        if source_environment_key.is_empty() {
            return Err(ValidationError::MissingField("sourceEnvironmentKey").into());
        }
        let context = context.unwrap_or_default();

        let (flags, variations) = self.fetch(key, source_environment_key, &context).await?;
        let project =
            Project::new(key, source_environment_key, context, flags).with_variations(variations);
        self.store.insert_project(&project).await?;

        tracing::info!(
            project = key,
            environment = source_environment_key,
            flags = project.all_flags_state.len(),
            "Created project"
        );
        Ok(project)
    }

    /// Re-sync an existing project, optionally switching context or source
    /// environment, and notify observers of the new effective state.
    pub async fn update_project(
        &self,
        key: &str,
        context: Option<Context>,
        source_environment_key: Option<String>,
    ) -> Result<Project, CoreError> {
        let mut project = self.store.get_dev_project(key).await?;
        if let Some(context) = context {
            project.context = context;
        }
        if let Some(env) = source_environment_key {
            if env.is_empty() {
                return Err(ValidationError::MissingField("sourceEnvironmentKey").into());
            }
            project.source_environment_key = env;
        }

        let (flags, variations) = self
            .fetch(key, &project.source_environment_key, &project.context)
            .await?;
        project.all_flags_state = flags;
        project.available_variations = variations;
        project.last_sync_time = Utc::now();

        if !self.store.update_project(&project).await? {
            return Err(CoreError::not_found(format!("project {key}")));
        }

        let effective = self.get_flag_state_with_overrides(&project).await?;
        let notified = self.observers.notify(&ObserverEvent::Sync(SyncEvent {
            project_key: key.to_string(),
            all_flags_state: effective,
        }));
        tracing::info!(project = key, notified, "Updated project");
        Ok(project)
    }

    /// What an SDK should currently see: upstream state with every override
    /// for the project composed on top.
    pub async fn get_flag_state_with_overrides(
        &self,
        project: &Project,
    ) -> Result<FlagsState, CoreError> {
        let overrides: HashMap<String, Override> = self
            .store
            .get_overrides_for_project(&project.key)
            .await?
            .into_iter()
            .map(|o| (o.flag_key.clone(), o))
            .collect();

        Ok(project
            .all_flags_state
            .iter()
            .map(|(key, state)| {
                let state = match overrides.get(key) {
                    Some(ovr) => ovr.apply(state),
                    None => state.clone(),
                };
                (key.clone(), state)
            })
            .collect())
    }

    /// Effective state of a project by key.
    pub async fn effective_flags(&self, key: &str) -> Result<FlagsState, CoreError> {
        let project = self.store.get_dev_project(key).await?;
        self.get_flag_state_with_overrides(&project).await
    }

    /// Override one flag and notify observers of its new effective state.
    pub async fn upsert_override(
        &self,
        project_key: &str,
        flag_key: &str,
        value: Value,
    ) -> Result<FlagState, CoreError> {
        let project = self.store.get_dev_project(project_key).await?;
        let base = project
            .all_flags_state
            .get(flag_key)
            .ok_or_else(|| CoreError::not_found(format!("flag {flag_key}")))?;

        let stored = self
            .store
            .upsert_override(&Override::new(project_key, flag_key, value))
            .await?;
        let flag_state = stored.apply(base);

        self.notify_override(project_key, flag_key, flag_state.clone());
        Ok(flag_state)
    }

    /// Deactivate an override. The value reverts to upstream while the
    /// version keeps moving forward.
    pub async fn delete_override(
        &self,
        project_key: &str,
        flag_key: &str,
    ) -> Result<FlagState, CoreError> {
        let project = self.store.get_dev_project(project_key).await?;
        let base = project
            .all_flags_state
            .get(flag_key)
            .ok_or_else(|| CoreError::not_found(format!("flag {flag_key}")))?;

        let version = self
            .store
            .deactivate_override(project_key, flag_key)
            .await?;
        let flag_state = FlagState {
            value: base.value.clone(),
            version: base.version + version,
        };

        self.notify_override(project_key, flag_key, flag_state.clone());
        Ok(flag_state)
    }

    fn notify_override(&self, project_key: &str, flag_key: &str, flag_state: FlagState) {
        let notified = self.observers.notify(&ObserverEvent::Override(OverrideEvent {
            project_key: project_key.to_string(),
            flag_key: flag_key.to_string(),
            flag_state,
        }));
        tracing::debug!(project = project_key, flag = flag_key, notified, "Override changed");
    }

    /// Create a project from an export document without calling upstream.
    /// Overrides are written as-is and nobody is notified.
    pub async fn import_project(
        &self,
        key: &str,
        payload: ProjectExport,
    ) -> Result<Project, CoreError> {
        let source_environment_key = payload
            .source_environment_key
            .filter(|env| !env.is_empty())
            .ok_or(ValidationError::MissingField("sourceEnvironmentKey"))?;
        let flags_state = payload
            .flags_state
            .ok_or(ValidationError::MissingField("flagsState"))?;

        let project = Project::new(
            key,
            source_environment_key,
            payload.context.unwrap_or_default(),
            flags_state,
        )
        .with_variations(flatten(payload.available_variations));
        self.store.insert_project(&project).await?;

        for (flag_key, exported) in payload.overrides {
            let ovr = exported.into_override(key, &flag_key);
            if let Err(e) = self.store.upsert_override(&ovr).await {
                tracing::warn!(project = key, flag = %flag_key, "Import failed, rolling back: {}", e);
                self.store.delete_dev_project(key).await?;
                return Err(e.into());
            }
        }

        tracing::info!(project = key, flags = project.all_flags_state.len(), "Imported project");
        Ok(project)
    }

    pub async fn import_project_from_file(
        &self,
        key: &str,
        path: impl AsRef<Path>,
    ) -> Result<Project, CoreError> {
        let bytes = tokio::fs::read(path.as_ref())
            .await
            .map_err(|e| CoreError::Io(format!("{}: {e}", path.as_ref().display())))?;
        let payload: ProjectExport = serde_json::from_slice(&bytes)
            .map_err(|e| ValidationError::InvalidPayload(e.to_string()))?;
        self.import_project(key, payload).await
    }

    pub async fn export_project(&self, key: &str) -> Result<ProjectExport, CoreError> {
        let project = self.store.get_dev_project(key).await?;
        let overrides = self.store.get_overrides_for_project(key).await?;
        Ok(ProjectExport::new(&project, &overrides))
    }

    pub async fn get_project(&self, key: &str) -> Result<Project, CoreError> {
        Ok(self.store.get_dev_project(key).await?)
    }

    pub async fn list_projects(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.store.get_dev_project_keys().await?)
    }

    /// Refresh every stored project from upstream, keeping its context and
    /// source environment. A failing project does not stop the others.
    pub async fn sync_all(&self) -> Result<SyncStats, CoreError> {
        let mut stats = SyncStats::default();
        for key in self.store.get_dev_project_keys().await? {
            match self.update_project(&key, None, None).await {
                Ok(_) => stats.projects_synced += 1,
                Err(e) => {
                    tracing::warn!(project = %key, "Periodic sync failed: {}", e);
                    stats.projects_failed += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Run the periodic sync loop. Projects were just synced on creation,
    /// so the first pass waits one interval.
    pub async fn run(&self, interval: Duration) {
        loop {
            sleep(interval).await;

            match self.sync_all().await {
                Ok(stats) => {
                    if stats.projects_synced + stats.projects_failed > 0 {
                        tracing::info!(
                            "Synced {} projects, {} failed",
                            stats.projects_synced,
                            stats.projects_failed
                        );
                    }
                }
                Err(e) => {
                    tracing::error!("Sync error: {}", e);
                }
            }
        }
    }

    pub async fn get_overrides(&self, key: &str) -> Result<Vec<Override>, CoreError> {
        Ok(self.store.get_overrides_for_project(key).await?)
    }

    pub async fn delete_project(&self, key: &str) -> Result<(), CoreError> {
        if !self.store.delete_dev_project(key).await? {
            return Err(CoreError::not_found(format!("project {key}")));
        }
        tracing::info!(project = key, "Deleted project");
        Ok(())
    }

    /// Environments of the upstream project, optionally filtered by name.
    pub async fn get_project_environments(
        &self,
        key: &str,
        query: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<Environment>, CoreError> {
        Ok(self.api.get_project_environments(key, query, limit).await?)
    }

    pub async fn create_backup(&self) -> Result<Backup, CoreError> {
        Ok(self.store.create_backup().await?)
    }

    /// Replace the store with a backup and send every restored project's
    /// effective state to connected observers. Returns the restored keys.
    pub async fn restore_backup(&self, bytes: &[u8]) -> Result<Vec<String>, CoreError> {
        self.store.restore_backup(bytes).await?;

        let projects = self.store.get_dev_projects().await?;
        let mut keys = Vec::with_capacity(projects.len());
        for project in projects {
            let effective = self.get_flag_state_with_overrides(&project).await?;
            self.observers.notify(&ObserverEvent::Sync(SyncEvent {
                project_key: project.key.clone(),
                all_flags_state: effective,
            }));
            keys.push(project.key);
        }

        tracing::info!(projects = keys.len(), "Restored backup");
        Ok(keys)
    }
}
