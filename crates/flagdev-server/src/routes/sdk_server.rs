use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    middleware,
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};

use flagdev_core::sdk::{server_flags, ServerAllPayload, ServerFlag};

use crate::error::ApiError;
use crate::middleware::{resolve_sdk_key, ProjectKey};
use crate::routes::streaming::{flag_stream, FlagFormat};
use crate::state::AppState;

/// Routes for server-side SDKs, keyed by the SDK key in `Authorization`.
pub fn routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/all", get(stream_all))
        .route("/sdk/latest-all", get(latest_all))
        .route("/sdk/flags", get(all_flags))
        .route("/sdk/flags/{flagKey}", get(one_flag))
        .route("/sdk/latest-flags", get(all_flags))
        .route("/sdk/latest-flags/{flagKey}", get(one_flag))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            resolve_sdk_key,
        ))
}

async fn stream_all(
    State(state): State<AppState>,
    Extension(ProjectKey(key)): Extension<ProjectKey>,
) -> Result<impl IntoResponse, ApiError> {
    flag_stream(state, key, FlagFormat::Server).await
}

async fn latest_all(
    State(state): State<AppState>,
    Extension(ProjectKey(key)): Extension<ProjectKey>,
) -> Result<Json<ServerAllPayload>, ApiError> {
    let flags = state.projects.effective_flags(&key).await?;
    Ok(Json(ServerAllPayload::new(&flags)))
}

async fn all_flags(
    State(state): State<AppState>,
    Extension(ProjectKey(key)): Extension<ProjectKey>,
) -> Result<Json<BTreeMap<String, ServerFlag>>, ApiError> {
    let flags = state.projects.effective_flags(&key).await?;
    Ok(Json(server_flags(&flags)))
}

async fn one_flag(
    State(state): State<AppState>,
    Extension(ProjectKey(key)): Extension<ProjectKey>,
    Path(flag_key): Path<String>,
) -> Result<Json<ServerFlag>, ApiError> {
    let flags = state.projects.effective_flags(&key).await?;
    let flag = flags
        .get(&flag_key)
        .ok_or_else(|| ApiError::not_found(format!("flag {flag_key} not found")))?;
    Ok(Json(ServerFlag::new(flag_key.as_str(), flag)))
}
