//! Flag streams shared by the server-side and client-side SDK routes.
//!
//! Every stream registers its observer before reading the initial snapshot,
//! so a change racing the snapshot is queued on the channel rather than
//! lost. The stream remembers what it last sent and only emits frames for
//! flags whose state actually differs.

use std::collections::VecDeque;
use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use serde_json::{json, Value};

use flagdev_core::{sdk, FlagState, FlagsState, ObserverEvent, Subscription};

use crate::error::ApiError;
use crate::state::AppState;

/// Events buffered per subscriber before new ones are dropped.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Wire dialect of a flag stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagFormat {
    /// Full flag definitions, as read by server-side SDKs.
    Server,
    /// Evaluated values, as read by client-side and mobile SDKs.
    Client,
}

impl FlagFormat {
    pub fn put(self, flags: &FlagsState) -> Value {
        match self {
            FlagFormat::Server => sdk::server_put(flags),
            FlagFormat::Client => json!(sdk::client_flags(flags)),
        }
    }

    pub fn patch(self, flag_key: &str, state: &FlagState) -> Value {
        match self {
            FlagFormat::Server => sdk::server_patch(flag_key, state),
            FlagFormat::Client => sdk::client_patch(flag_key, state),
        }
    }

    pub fn delete(self, flag_key: &str, version: i64) -> Value {
        match self {
            FlagFormat::Server => sdk::server_delete(flag_key, version),
            FlagFormat::Client => sdk::client_delete(flag_key, version),
        }
    }
}

/// One flag-level difference between two snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagChange {
    Upsert(String, FlagState),
    /// Carries a version above the last one sent.
    Delete(String, i64),
}

/// Changes needed to move a client from `last` to `next`.
pub fn diff(last: &FlagsState, next: &FlagsState) -> Vec<FlagChange> {
    let mut changes: Vec<FlagChange> = next
        .iter()
        .filter(|(key, state)| last.get(key) != Some(*state))
        .map(|(key, state)| FlagChange::Upsert(key.clone(), state.clone()))
        .collect();

    changes.extend(
        last.iter()
            .filter(|(key, _)| !next.contains(key))
            .map(|(key, state)| FlagChange::Delete(key.clone(), state.version + 1)),
    );
    changes
}

pub(crate) fn frame(name: &str, data: &Value) -> Event {
    Event::default().event(name).data(data.to_string())
}

struct FlagStream {
    subscription: Subscription,
    project_key: String,
    format: FlagFormat,
    last: FlagsState,
    pending: VecDeque<Event>,
}

impl FlagStream {
    fn apply(&mut self, event: &ObserverEvent) {
        let next = match event {
            ObserverEvent::Sync(e) if e.project_key == self.project_key => {
                e.all_flags_state.clone()
            }
            ObserverEvent::Override(e) if e.project_key == self.project_key => {
                self.last.with_flag(&e.flag_key, e.flag_state.clone())
            }
            _ => return,
        };

        for change in diff(&self.last, &next) {
            let event = match change {
                FlagChange::Upsert(key, state) => frame("patch", &self.format.patch(&key, &state)),
                FlagChange::Delete(key, version) => {
                    frame("delete", &self.format.delete(&key, version))
                }
            };
            self.pending.push_back(event);
        }
        self.last = next;
    }
}

/// Open a flag stream for a project: a `put` frame with the current
/// effective state, then `patch`/`delete` frames as it changes.
pub async fn flag_stream(
    state: AppState,
    project_key: String,
    format: FlagFormat,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.observers.subscribe(SUBSCRIBER_BUFFER);
    let initial = state.projects.effective_flags(&project_key).await?;

    tracing::debug!(
        project = %project_key,
        observer = %subscription.id(),
        ?format,
        "Flag stream opened"
    );

    let mut pending = VecDeque::new();
    pending.push_back(frame("put", &format.put(&initial)));
    let flag_stream = FlagStream {
        subscription,
        project_key,
        format,
        last: initial,
        pending,
    };

    let stream = stream::unfold(flag_stream, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            let event = st.subscription.recv().await?;
            st.apply(&event);
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.heartbeat)))
}
