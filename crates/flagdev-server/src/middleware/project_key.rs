//! Normalizes the credential shapes SDKs use into one project key.
//!
//! Server-side and mobile SDKs send the key in `Authorization`, either bare
//! or as `api_key <key>`. Browser SDKs put a client-side ID in the path,
//! which is either the project key itself or its base64 encoding.

use std::collections::HashMap;

use axum::{
    extract::{Path, Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use flagdev_core::{context::decode_base64, StorageError};

use crate::error::ApiError;
use crate::state::AppState;

/// The resolved project key, placed in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectKey(pub String);

fn key_from_authorization(value: &str) -> Option<&str> {
    let value = value.trim();
    let key = match (value.get(..7), value.get(7..)) {
        (Some(prefix), Some(rest))
            if prefix.eq_ignore_ascii_case("api_key") && (rest.is_empty() || rest.starts_with(' ')) =>
        {
            rest.trim()
        }
        _ => value,
    };
    (!key.is_empty()).then_some(key)
}

async fn project_exists(state: &AppState, key: &str) -> Result<bool, ApiError> {
    match state.store.get_dev_project(key).await {
        Ok(_) => Ok(true),
        Err(StorageError::NotFound(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Resolve the project from the `Authorization` header.
pub async fn resolve_sdk_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(key_from_authorization)
        .map(str::to_string)
        .ok_or_else(|| ApiError::unauthorized("missing Authorization header"))?;

    if !project_exists(&state, &key).await? {
        return Err(ApiError::not_found(format!("project {key} not found")));
    }

    request.extensions_mut().insert(ProjectKey(key));
    Ok(next.run(request).await)
}

/// Resolve the project from the `{envId}` path segment.
pub async fn resolve_env_id(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let env_id = params
        .get("envId")
        .ok_or_else(|| ApiError::not_found("missing environment id"))?;

    let key = if project_exists(&state, env_id).await? {
        env_id.clone()
    } else {
        let decoded = decode_base64(env_id)
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|key| !key.is_empty());
        match decoded {
            Some(key) if project_exists(&state, &key).await? => key,
            _ => return Err(ApiError::not_found(format!("project {env_id} not found"))),
        }
    };

    request.extensions_mut().insert(ProjectKey(key));
    Ok(next.run(request).await)
}
