use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use flagdev_core::{
    DebugSessionsPage, EventStore, EventsPage, Observer, ObserverEvent, ObserverId, Observers,
    Page, ReceivedEvent, Subscription, ValidationError,
};

use crate::error::ApiError;
use crate::routes::streaming::{frame, SUBSCRIBER_BUFFER};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/dev/debug-sessions", get(list_sessions))
        .route("/dev/debug-sessions/{sessionKey}", delete(delete_session))
        .route("/dev/debug-sessions/{sessionKey}/events", get(list_events))
        .route("/dev/events/tee", get(tee))
}

fn event_store(state: &AppState) -> Result<Arc<dyn EventStore>, ApiError> {
    state
        .event_store
        .clone()
        .ok_or_else(|| ApiError::not_found("debug capture is disabled"))
}

fn parse_number(
    params: &HashMap<String, String>,
    name: &str,
    default: i64,
) -> Result<i64, ValidationError> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .ok_or_else(|| {
                ValidationError::InvalidPagination(format!(
                    "{name} must be a non-negative integer"
                ))
            }),
    }
}

/// Read `limit` and `offset` from the query string.
pub fn parse_page(params: &HashMap<String, String>) -> Result<Page, ValidationError> {
    let limit = parse_number(params, "limit", Page::DEFAULT_LIMIT)?;
    let offset = parse_number(params, "offset", 0)?;
    Ok(Page::new(limit, offset))
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<DebugSessionsPage>, ApiError> {
    let store = event_store(&state)?;
    let page = parse_page(&params)?;
    Ok(Json(store.query_debug_sessions(page).await?))
}

async fn list_events(
    State(state): State<AppState>,
    Path(session_key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<EventsPage>, ApiError> {
    let store = event_store(&state)?;
    let page = parse_page(&params)?;
    let kind = params.get("kind").map(String::as_str);
    Ok(Json(store.query_events(&session_key, kind, page).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let store = event_store(&state)?;
    if !store.delete_debug_session(&session_key).await? {
        return Err(ApiError::not_found(format!(
            "debug session {session_key} not found"
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Forwards SDK events to the session writer as they arrive.
struct Recorder {
    tx: mpsc::UnboundedSender<ReceivedEvent>,
}

impl Observer for Recorder {
    fn handle(&self, event: &ObserverEvent) {
        if let ObserverEvent::SdkEvent(received) = event {
            // Closed only once the writer is gone.
            let _ = self.tx.send(received.clone());
        }
    }
}

/// Deregisters the recorder when the tee stream goes away.
struct RecorderGuard {
    observers: Arc<Observers>,
    id: ObserverId,
}

impl Drop for RecorderGuard {
    fn drop(&mut self) {
        self.observers.deregister(self.id);
    }
}

/// Register a recorder for `session_key` and spawn the task that writes its events.
///
/// The writer drains whatever is queued after the guard drops, then exits.
fn start_recorder(
    observers: &Arc<Observers>,
    store: Arc<dyn EventStore>,
    session_key: String,
) -> RecorderGuard {
    let (tx, mut rx) = mpsc::unbounded_channel::<ReceivedEvent>();
    let id = observers.register(Arc::new(Recorder { tx }));

    tokio::spawn(async move {
        while let Some(received) = rx.recv().await {
            if let Err(e) = store
                .write_event(&session_key, &received.kind, &received.data)
                .await
            {
                tracing::warn!(session = %session_key, "Failed to record SDK event: {}", e);
            }
        }
        tracing::debug!(session = %session_key, "Debug session recorder stopped");
    });

    RecorderGuard {
        observers: Arc::clone(observers),
        id,
    }
}

struct Tee {
    subscription: Subscription,
    _recorder: RecorderGuard,
    opening: Option<Event>,
}

impl Tee {
    async fn next_frame(&mut self) -> Option<Event> {
        if let Some(event) = self.opening.take() {
            return Some(event);
        }

        let event = self.subscription.recv().await?;
        Some(match event {
            ObserverEvent::SdkEvent(received) => frame(&received.kind, &received.data),
            ObserverEvent::Sync(sync) => frame(
                "sync",
                &json!({
                    "projectKey": sync.project_key,
                    "allFlagsState": sync.all_flags_state,
                }),
            ),
            ObserverEvent::Override(ovr) => frame(
                "override",
                &json!({
                    "projectKey": ovr.project_key,
                    "flagKey": ovr.flag_key,
                    "flagState": ovr.flag_state,
                }),
            ),
        })
    }
}

/// Stream every observer event, recording SDK events under a new session.
///
/// Recording does not depend on the client reading the stream.
async fn tee(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let store = event_store(&state)?;
    let session_key = Uuid::new_v4().to_string();
    store.create_debug_session(&session_key).await?;

    let recorder = start_recorder(&state.observers, store, session_key.clone());
    let subscription = state.observers.subscribe(SUBSCRIBER_BUFFER);
    tracing::info!(session = %session_key, observer = %subscription.id(), "Debug tee opened");

    let tee = Tee {
        subscription,
        _recorder: recorder,
        opening: Some(frame("session", &json!({ "sessionKey": session_key }))),
    };

    let stream = stream::unfold(tee, |mut tee| async move {
        let event = tee.next_frame().await?;
        Some((Ok(event), tee))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.heartbeat)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_page_defaults_and_clamping() {
        assert_eq!(parse_page(&params(&[])).unwrap(), Page::default());
        let page = parse_page(&params(&[("limit", "5000"), ("offset", "20")])).unwrap();
        assert_eq!(page.limit, Page::MAX_LIMIT);
        assert_eq!(page.offset, 20);
    }

    #[test]
    fn test_invalid_pagination_is_rejected() {
        assert!(matches!(
            parse_page(&params(&[("limit", "-1")])),
            Err(ValidationError::InvalidPagination(_))
        ));
        assert!(matches!(
            parse_page(&params(&[("offset", "abc")])),
            Err(ValidationError::InvalidPagination(_))
        ));
    }
}
