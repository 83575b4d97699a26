use std::sync::Arc;
use std::time::Duration;

use flagdev_core::{EventStore, Observers, Store};
use flagdev_sync::ProjectService;

use crate::config::CorsConfig;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub projects: Arc<ProjectService>,
    pub store: Arc<dyn Store>,
    pub observers: Arc<Observers>,
    /// None when debug capture is disabled.
    pub event_store: Option<Arc<dyn EventStore>>,
    pub heartbeat: Duration,
    pub cors: CorsConfig,
}

impl AppState {
    pub fn new(
        projects: Arc<ProjectService>,
        event_store: Option<Arc<dyn EventStore>>,
        heartbeat: Duration,
        cors: CorsConfig,
    ) -> Self {
        Self {
            store: Arc::clone(projects.store()),
            observers: Arc::clone(projects.observers()),
            projects,
            event_store,
            heartbeat,
            cors,
        }
    }
}
