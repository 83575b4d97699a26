use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Ready once the project store answers queries.
async fn ready(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    state.store.get_dev_project_keys().await?;
    Ok(Json(HealthResponse { status: "ok" }))
}
