use flagdev_core::{CoreError, Project, StorageError, ValidationError};
use flagdev_sync::ProjectService;

use crate::config::StartupSync;

/// Bring the configured project up to date before serving.
///
/// A new project is imported from the file when one is configured and
/// synced from upstream otherwise; an existing project is re-synced.
/// Configured overrides are applied last.
pub async fn sync_project(
    projects: &ProjectService,
    startup: &StartupSync,
) -> Result<Project, CoreError> {
    let key = startup.project.as_str();
    let exists = match projects.get_project(key).await {
        Ok(_) => true,
        Err(CoreError::Storage(StorageError::NotFound(_))) => false,
        Err(e) => return Err(e),
    };

    let project = match (&startup.import_file, exists) {
        (Some(path), false) => {
            tracing::info!(project = key, file = %path.display(), "Importing project");
            projects.import_project_from_file(key, path).await?
        }
        (_, true) => {
            tracing::info!(project = key, "Re-syncing existing project");
            projects
                .update_project(
                    key,
                    startup.context.clone(),
                    startup.source_environment_key.clone(),
                )
                .await?
        }
        (None, false) => {
            let env = startup
                .source_environment_key
                .as_deref()
                .ok_or(ValidationError::MissingField("sourceEnvironmentKey"))?;
            projects
                .create_project(key, env, startup.context.clone())
                .await?
        }
    };

    for (flag_key, value) in &startup.overrides {
        projects.upsert_override(key, flag_key, value.clone()).await?;
    }
    if !startup.overrides.is_empty() {
        tracing::info!(project = key, count = startup.overrides.len(), "Applied overrides");
    }

    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::{json, Map};

    use flagdev_core::{FlagState, FlagsState, InMemoryStore, Observers};
    use flagdev_sync::{RemoteFlag, StaticEvaluationSdk, StaticManagementApi};

    fn service(sdk: Arc<StaticEvaluationSdk>) -> ProjectService {
        let api = StaticManagementApi::new()
            .with_environment("p1", "production", "sdk-prod")
            .with_flags("p1", vec![RemoteFlag::new("f1", vec![])]);
        ProjectService::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(Observers::new()),
            Arc::new(api),
            sdk,
        )
    }

    fn startup(overrides: Map<String, serde_json::Value>) -> StartupSync {
        StartupSync {
            project: "p1".to_string(),
            source_environment_key: Some("production".to_string()),
            context: None,
            overrides,
            import_file: None,
        }
    }

    #[tokio::test]
    async fn test_creates_then_resyncs() {
        let sdk = Arc::new(StaticEvaluationSdk::new());
        sdk.set_flags(
            "sdk-prod",
            FlagsState::from_iter([("f1".to_string(), FlagState::new(true, 1))]),
        );
        let projects = service(Arc::clone(&sdk));

        let mut overrides = Map::new();
        overrides.insert("f1".to_string(), json!(false));
        sync_project(&projects, &startup(overrides)).await.unwrap();

        let flags = projects.effective_flags("p1").await.unwrap();
        assert_eq!(flags.get("f1"), Some(&FlagState::new(false, 2)));

        sync_project(&projects, &startup(Map::new())).await.unwrap();
        assert_eq!(sdk.calls(), 2);
    }

    #[tokio::test]
    async fn test_imports_new_project_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p1.json");
        std::fs::write(
            &path,
            json!({
                "sourceEnvironmentKey": "production",
                "flagsState": {"f1": {"value": "blue", "version": 4}}
            })
            .to_string(),
        )
        .unwrap();

        let sdk = Arc::new(StaticEvaluationSdk::new());
        let projects = service(Arc::clone(&sdk));
        let mut config = startup(Map::new());
        config.import_file = Some(path);

        let project = sync_project(&projects, &config).await.unwrap();
        assert_eq!(project.all_flags_state.get("f1"), Some(&FlagState::new("blue", 4)));
        assert_eq!(sdk.calls(), 0);
    }
}
