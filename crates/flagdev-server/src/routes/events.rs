use axum::{body::Bytes, extract::State, http::StatusCode, routing::post, Router};
use serde_json::Value;

use flagdev_core::{ObserverEvent, ReceivedEvent};

use crate::state::AppState;

/// Analytics and diagnostic sinks. Payloads are published to observers
/// (the debug tee) and never forwarded upstream.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/bulk", post(analytics))
        .route("/mobile", post(analytics))
        .route("/mobile/events", post(analytics))
        .route("/mobile/events/bulk", post(analytics))
        .route("/events/bulk/{envId}", post(analytics))
        .route("/diagnostic", post(diagnostic))
        .route("/mobile/events/diagnostic", post(diagnostic))
        .route("/events/diagnostic/{envId}", post(diagnostic))
}

/// Split a payload into individual events, tagging each with its kind.
pub fn received_events(payload: Value, fixed_kind: Option<&str>) -> Vec<ReceivedEvent> {
    let items = match payload {
        Value::Array(items) => items,
        other => vec![other],
    };

    items
        .into_iter()
        .map(|data| {
            let kind = fixed_kind
                .or_else(|| data.get("kind").and_then(Value::as_str))
                .unwrap_or("unknown")
                .to_string();
            ReceivedEvent { kind, data }
        })
        .collect()
}

fn publish(state: &AppState, body: &[u8], fixed_kind: Option<&str>) -> StatusCode {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::debug!("Discarding malformed SDK event payload: {}", e);
            return StatusCode::ACCEPTED;
        }
    };

    for event in received_events(payload, fixed_kind) {
        state.observers.notify(&ObserverEvent::SdkEvent(event));
    }
    StatusCode::ACCEPTED
}

async fn analytics(State(state): State<AppState>, body: Bytes) -> StatusCode {
    publish(&state, &body, None)
}

async fn diagnostic(State(state): State<AppState>, body: Bytes) -> StatusCode {
    publish(&state, &body, Some("diagnostic"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bulk_payload_is_split_by_kind() {
        let events = received_events(
            json!([
                {"kind": "feature", "key": "f1"},
                {"kind": "identify"},
                {"noKind": true}
            ]),
            None,
        );
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["feature", "identify", "unknown"]);
    }

    #[test]
    fn test_diagnostic_kind_is_fixed() {
        let events = received_events(json!({"kind": "diagnostic-init", "id": {}}), Some("diagnostic"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "diagnostic");
    }
}
