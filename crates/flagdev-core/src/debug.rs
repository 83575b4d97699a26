use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events captured during one debug-tee connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSession {
    pub key: String,
    pub written_at: DateTime<Utc>,
    pub event_count: i64,
}

/// A raw SDK payload recorded under a debug session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugEvent {
    pub id: i64,
    pub session_key: String,
    pub written_at: DateTime<Utc>,
    pub kind: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    pub events: Vec<DebugEvent>,
    pub total_count: i64,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSessionsPage {
    pub sessions: Vec<DebugSession>,
    pub total_count: i64,
    pub has_more: bool,
}

/// Validated limit/offset pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 1000;

    /// Clamp the limit to `MAX_LIMIT`; negative values are rejected by
    /// callers before reaching here.
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.clamp(0, Self::MAX_LIMIT),
            offset: offset.max(0),
        }
    }

    /// Whether rows remain after this page given the total row count.
    pub fn has_more(&self, returned: usize, total: i64) -> bool {
        self.offset + (returned as i64) < total
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LIMIT, 0)
    }
}
