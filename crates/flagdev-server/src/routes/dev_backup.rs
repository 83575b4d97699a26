use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/dev/backup",
        get(download_backup)
            .post(restore_backup)
            .layer(DefaultBodyLimit::disable()),
    )
}

/// Consistent SQLite snapshot of all projects, variations and overrides.
async fn download_backup(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let backup = state.projects.create_backup().await?;
    tracing::info!(bytes = backup.size, "Serving backup");

    Ok((
        [
            (header::CONTENT_TYPE, "application/vnd.sqlite3"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"flagdev-backup.db\"",
            ),
        ],
        backup.bytes,
    ))
}

#[derive(Serialize)]
struct RestoreResponse {
    projects: Vec<String>,
}

async fn restore_backup(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RestoreResponse>, ApiError> {
    let projects = state.projects.restore_backup(&body).await?;
    Ok(Json(RestoreResponse { projects }))
}
