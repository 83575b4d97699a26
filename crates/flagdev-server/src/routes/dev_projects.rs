use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flagdev_core::variation::{group_by_flag, Variation};
use flagdev_core::{Context, FlagState, FlagsState, Project, ValidationError};
use flagdev_sync::{Environment, ExportedOverride, ProjectExport};

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/dev/projects", get(list_projects))
        .route(
            "/dev/projects/{projectKey}",
            get(get_project)
                .post(create_project)
                .patch(update_project)
                .delete(delete_project),
        )
        .route("/dev/projects/{projectKey}/export", get(export_project))
        .route("/dev/projects/{projectKey}/import", post(import_project))
        .route(
            "/dev/projects/{projectKey}/environments",
            get(project_environments),
        )
        .route(
            "/dev/projects/{projectKey}/overrides/{flagKey}",
            put(put_override).delete(delete_override),
        )
}

/// Optional sections of the project response, from `?expand=`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Expand {
    pub overrides: bool,
    pub available_variations: bool,
}

impl Expand {
    /// Accepts repeated `expand` parameters and comma-separated lists.
    /// Pairs must already be percent-decoded.
    pub fn from_pairs(pairs: &[(String, String)]) -> Self {
        let mut expand = Expand::default();
        let values = pairs
            .iter()
            .filter(|(name, _)| name == "expand")
            .map(|(_, value)| value);
        for item in values.flat_map(|value| value.split(',')) {
            match item.trim() {
                "overrides" => expand.overrides = true,
                "availableVariations" => expand.available_variations = true,
                _ => {}
            }
        }
        expand
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
    key: String,
    source_environment_key: String,
    context: Context,
    last_sync_time: DateTime<Utc>,
    /// Effective state, overrides included.
    flags_state: FlagsState,
    #[serde(skip_serializing_if = "Option::is_none")]
    overrides: Option<BTreeMap<String, ExportedOverride>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    available_variations: Option<BTreeMap<String, Vec<Variation>>>,
}

async fn project_response(
    state: &AppState,
    project: Project,
    expand: Expand,
) -> Result<ProjectResponse, ApiError> {
    let flags_state = state.projects.get_flag_state_with_overrides(&project).await?;

    let overrides = if expand.overrides {
        let overrides = state.projects.get_overrides(&project.key).await?;
        Some(
            overrides
                .iter()
                .filter(|o| o.active)
                .map(|o| (o.flag_key.clone(), ExportedOverride::from(o)))
                .collect(),
        )
    } else {
        None
    };

    let available_variations = expand
        .available_variations
        .then(|| group_by_flag(&project.available_variations));

    Ok(ProjectResponse {
        key: project.key,
        source_environment_key: project.source_environment_key,
        context: project.context,
        last_sync_time: project.last_sync_time,
        flags_state,
        overrides,
        available_variations,
    })
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.projects.list_projects().await?))
}

async fn get_project(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<ProjectResponse>, ApiError> {
    let project = state.projects.get_project(&key).await?;
    let expand = Expand::from_pairs(&pairs);
    Ok(Json(project_response(&state, project, expand).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectRequest {
    #[serde(default)]
    source_environment_key: Option<String>,
    #[serde(default)]
    context: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProjectRequest {
    #[serde(default)]
    source_environment_key: Option<String>,
    #[serde(default)]
    context: Option<Value>,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ValidationError::InvalidPayload(e.to_string()).into())
}

fn parse_context(context: Option<Value>) -> Result<Option<Context>, ApiError> {
    Ok(context.map(Context::from_value).transpose()?)
}

async fn create_project(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<ProjectResponse>), ApiError> {
    let request: CreateProjectRequest = parse_body(&body)?;
    let source_environment_key = request
        .source_environment_key
        .ok_or(ValidationError::MissingField("sourceEnvironmentKey"))?;
    let context = parse_context(request.context)?;

    let project = state
        .projects
        .create_project(&key, &source_environment_key, context)
        .await?;
    let response = project_response(&state, project, Expand::default()).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn update_project(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<ProjectResponse>, ApiError> {
    let request: UpdateProjectRequest = if body.is_empty() {
        UpdateProjectRequest::default()
    } else {
        parse_body(&body)?
    };
    let context = parse_context(request.context)?;

    let project = state
        .projects
        .update_project(&key, context, request.source_environment_key)
        .await?;
    Ok(Json(
        project_response(&state, project, Expand::default()).await?,
    ))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.projects.delete_project(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn export_project(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ProjectExport>, ApiError> {
    Ok(Json(state.projects.export_project(&key).await?))
}

async fn import_project(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<ProjectResponse>), ApiError> {
    let payload: ProjectExport = parse_body(&body)?;
    let project = state.projects.import_project(&key, payload).await?;
    let response = project_response(&state, project, Expand::default()).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Debug, Deserialize)]
struct EnvironmentsQuery {
    name: Option<String>,
    limit: Option<u32>,
}

async fn project_environments(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<EnvironmentsQuery>,
) -> Result<Json<Vec<Environment>>, ApiError> {
    let environments = state
        .projects
        .get_project_environments(&key, query.name.as_deref(), query.limit)
        .await?;
    Ok(Json(environments))
}

/// The body is the raw JSON value the flag should take.
async fn put_override(
    State(state): State<AppState>,
    Path((key, flag_key)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<FlagState>, ApiError> {
    let value: Value = parse_body(&body)?;
    let flag_state = state
        .projects
        .upsert_override(&key, &flag_key, value)
        .await?;
    Ok(Json(flag_state))
}

async fn delete_override(
    State(state): State<AppState>,
    Path((key, flag_key)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.projects.delete_override(&key, &flag_key).await?;
    Ok(StatusCode::NO_CONTENT)
}
