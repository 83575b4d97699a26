use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flagdev_core::{EventStore, Observers};
use flagdev_db::{SqliteEventStore, SqliteStore};
use flagdev_server::{create_router, startup, AppState, Config};
use flagdev_sync::{HttpEvaluationSdk, HttpManagementApi, ProjectService};

fn fail(context: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", context, err);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Optional: FLAGDEV_LISTEN_ADDR, FLAGDEV_DB_PATH, FLAGDEV_EVENTS_DB_PATH, FLAGDEV_ACCESS_TOKEN");
            eprintln!("Periodic sync: FLAGDEV_SYNC_INTERVAL_SECS (0 disables)");
            eprintln!("Startup sync: FLAGDEV_PROJECT with FLAGDEV_SOURCE_ENV or FLAGDEV_IMPORT_FILE");
            std::process::exit(1);
        }
    };

    tracing::info!("Starting flagdev server");
    tracing::info!("Listen address: {}", config.listen_addr);
    tracing::info!("Database path: {}", config.db_path.display());

    // Open databases
    let store = SqliteStore::open(&config.db_path)
        .await
        .unwrap_or_else(|e| fail("Database error", e));

    let event_store: Option<Arc<dyn EventStore>> = match &config.events_db_path {
        Some(path) => {
            tracing::info!("Debug event database: {}", path.display());
            let events = SqliteEventStore::open(path)
                .await
                .unwrap_or_else(|e| fail("Event database error", e));
            if let Err(e) = events.delete_orphan_sessions().await {
                tracing::warn!("Could not remove empty debug sessions: {}", e);
            }
            Some(Arc::new(events))
        }
        None => {
            tracing::info!("Debug event capture disabled");
            None
        }
    };

    if config.access_token.is_none() {
        tracing::warn!("FLAGDEV_ACCESS_TOKEN not set, upstream syncs will fail");
    }
    let api = HttpManagementApi::new(&config.api_base_uri, config.access_token.clone())
        .unwrap_or_else(|e| fail("HTTP client error", e));
    let sdk = HttpEvaluationSdk::new(&config.sdk_base_uri)
        .unwrap_or_else(|e| fail("HTTP client error", e));

    let projects = Arc::new(ProjectService::new(
        Arc::new(store),
        Arc::new(Observers::new()),
        Arc::new(api),
        Arc::new(sdk),
    ));

    // Sync the configured project, if any
    if let Some(startup) = &config.startup {
        if let Err(e) = startup::sync_project(&projects, startup).await {
            fail("Startup sync failed", e);
        }
        if config.sync_once {
            tracing::info!("Sync complete, exiting");
            return;
        }
    }

    // Start periodic sync if configured
    if let Some(interval) = config.sync_interval() {
        tracing::info!("Periodic sync every {:?}", interval);
        let projects = Arc::clone(&projects);
        tokio::spawn(async move {
            projects.run(interval).await;
        });
    }

    let state = AppState::new(
        projects,
        event_store,
        config.heartbeat(),
        config.cors.clone(),
    );
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .unwrap_or_else(|e| fail("Failed to bind to address", e));

    tracing::info!("Server running at http://{}", config.listen_addr);

    if let Err(e) = axum::serve(listener, app).await {
        fail("Server error", e);
    }
}
