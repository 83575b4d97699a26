//! Routes for client-side and mobile SDKs.
//!
//! Mobile SDKs authenticate with a key in `Authorization` (`/meval`,
//! `/msdk`); browser SDKs put an environment id in the path (`/eval`,
//! `/sdk/evalx`). Contexts arrive base64-encoded in the path for GET and
//! as the JSON body for REPORT. Values are not evaluated per context, but
//! the context must still be well formed.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{any, get},
    Extension, Json, Router,
};
use serde_json::{json, Value};

use flagdev_core::sdk::{client_flags, ClientFlag};
use flagdev_core::Context;

use crate::error::ApiError;
use crate::middleware::{resolve_env_id, resolve_sdk_key, ProjectKey};
use crate::routes::streaming::{flag_stream, FlagFormat};
use crate::state::AppState;

pub fn routes(state: &AppState) -> Router<AppState> {
    let mobile = Router::new()
        .route("/meval/{context}", get(stream_get))
        .route("/meval", any(stream_report))
        .route("/msdk/evalx/contexts/{context}", get(poll_get))
        .route("/msdk/evalx/users/{context}", get(poll_get))
        .route("/msdk/evalx/context", any(poll_report))
        .route("/msdk/evalx/user", any(poll_report))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            resolve_sdk_key,
        ));

    let browser = Router::new()
        .route("/eval/{envId}/{context}", get(env_stream_get))
        .route("/eval/{envId}", any(stream_report))
        .route("/sdk/evalx/{envId}/contexts/{context}", get(env_poll_get))
        .route("/sdk/evalx/{envId}/users/{context}", get(env_poll_get))
        .route("/sdk/evalx/{envId}/context", any(poll_report))
        .route("/sdk/evalx/{envId}/user", any(poll_report))
        .route("/sdk/goals/{envId}", get(goals))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            resolve_env_id,
        ));

    mobile.merge(browser)
}

fn require_report(method: &Method) -> Result<(), ApiError> {
    if method.as_str() == "REPORT" {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            format!("{method} is not supported here, use REPORT"),
        ))
    }
}

async fn client_payload(
    state: &AppState,
    project_key: &str,
) -> Result<Json<BTreeMap<String, ClientFlag>>, ApiError> {
    let flags = state.projects.effective_flags(project_key).await?;
    Ok(Json(client_flags(&flags)))
}

async fn stream_get(
    State(state): State<AppState>,
    Extension(ProjectKey(key)): Extension<ProjectKey>,
    Path(context): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Context::from_base64(&context)?;
    flag_stream(state, key, FlagFormat::Client).await
}

async fn env_stream_get(
    State(state): State<AppState>,
    Extension(ProjectKey(key)): Extension<ProjectKey>,
    Path((_env_id, context)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Context::from_base64(&context)?;
    flag_stream(state, key, FlagFormat::Client).await
}

async fn stream_report(
    State(state): State<AppState>,
    Extension(ProjectKey(key)): Extension<ProjectKey>,
    method: Method,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    require_report(&method)?;
    Context::from_json_bytes(&body)?;
    flag_stream(state, key, FlagFormat::Client).await
}

async fn poll_get(
    State(state): State<AppState>,
    Extension(ProjectKey(key)): Extension<ProjectKey>,
    Path(context): Path<String>,
) -> Result<Json<BTreeMap<String, ClientFlag>>, ApiError> {
    Context::from_base64(&context)?;
    client_payload(&state, &key).await
}

async fn env_poll_get(
    State(state): State<AppState>,
    Extension(ProjectKey(key)): Extension<ProjectKey>,
    Path((_env_id, context)): Path<(String, String)>,
) -> Result<Json<BTreeMap<String, ClientFlag>>, ApiError> {
    Context::from_base64(&context)?;
    client_payload(&state, &key).await
}

async fn poll_report(
    State(state): State<AppState>,
    Extension(ProjectKey(key)): Extension<ProjectKey>,
    method: Method,
    body: Bytes,
) -> Result<Json<BTreeMap<String, ClientFlag>>, ApiError> {
    require_report(&method)?;
    Context::from_json_bytes(&body)?;
    client_payload(&state, &key).await
}

/// Goals power click and page-view experiments, which are not relayed.
async fn goals() -> Json<Value> {
    Json(json!([]))
}
