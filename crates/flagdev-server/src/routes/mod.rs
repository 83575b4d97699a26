pub mod dev_backup;
pub mod dev_debug;
pub mod dev_projects;
pub mod events;
pub mod health;
pub mod sdk_client;
pub mod sdk_server;
pub mod streaming;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::middleware::cors_layer;
use crate::state::AppState;

fn with_cors(router: Router<AppState>, cors: Option<&CorsLayer>) -> Router<AppState> {
    match cors {
        Some(layer) => router.layer(layer.clone()),
        None => router,
    }
}

/// Server-side SDK routes are called from backends and carry no CORS
/// headers; every browser-reachable group gets the configured policy.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.cors);

    let browser_facing = Router::new()
        .merge(sdk_client::routes(&state))
        .merge(events::routes())
        .merge(dev_projects::routes())
        .merge(dev_backup::routes())
        .merge(dev_debug::routes());

    Router::new()
        .merge(sdk_server::routes(&state))
        .merge(with_cors(browser_facing, cors.as_ref()))
        .merge(health::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
