//! Wire shapes served to LaunchDarkly SDKs.
//!
//! Server-side SDKs expect full flag definitions with targeting rules. Values
//! here were already evaluated upstream, so every flag is rendered as an
//! "on" flag with a single variation and no rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::flags::{FlagState, FlagsState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fallthrough {
    pub variation: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSideAvailability {
    pub using_mobile_key: bool,
    pub using_environment_id: bool,
}

/// A flag definition in the server-side SDK data model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFlag {
    pub key: String,
    pub on: bool,
    pub prerequisites: Vec<Value>,
    pub targets: Vec<Value>,
    pub context_targets: Vec<Value>,
    pub rules: Vec<Value>,
    pub fallthrough: Fallthrough,
    pub off_variation: i64,
    pub variations: Vec<Value>,
    pub client_side_availability: ClientSideAvailability,
    pub client_side: bool,
    pub salt: String,
    pub track_events: bool,
    pub track_events_fallthrough: bool,
    pub debug_events_until_date: Option<i64>,
    pub version: i64,
    pub deleted: bool,
}

impl ServerFlag {
    pub fn new(key: impl Into<String>, state: &FlagState) -> Self {
        Self {
            key: key.into(),
            on: true,
            prerequisites: Vec::new(),
            targets: Vec::new(),
            context_targets: Vec::new(),
            rules: Vec::new(),
            fallthrough: Fallthrough { variation: 0 },
            off_variation: 0,
            variations: vec![state.value.clone()],
            client_side_availability: ClientSideAvailability {
                using_mobile_key: true,
                using_environment_id: true,
            },
            client_side: true,
            salt: String::new(),
            track_events: false,
            track_events_fallthrough: false,
            debug_events_until_date: None,
            version: state.version,
            deleted: false,
        }
    }
}

/// Build the server-side flags map for a whole snapshot.
pub fn server_flags(state: &FlagsState) -> BTreeMap<String, ServerFlag> {
    state
        .iter()
        .map(|(key, flag)| (key.clone(), ServerFlag::new(key, flag)))
        .collect()
}

/// Body of `/sdk/latest-all` and of the `put` frame on the `/all` stream.
#[derive(Debug, Clone, Serialize)]
pub struct ServerAllPayload {
    pub flags: BTreeMap<String, ServerFlag>,
    pub segments: BTreeMap<String, Value>,
}

impl ServerAllPayload {
    pub fn new(state: &FlagsState) -> Self {
        Self {
            flags: server_flags(state),
            segments: BTreeMap::new(),
        }
    }
}

/// `put` frame data for server-side streams.
pub fn server_put(state: &FlagsState) -> Value {
    json!({ "path": "/", "data": ServerAllPayload::new(state) })
}

/// `patch` frame data for one flag on server-side streams.
pub fn server_patch(flag_key: &str, state: &FlagState) -> Value {
    json!({
        "path": format!("/flags/{flag_key}"),
        "data": ServerFlag::new(flag_key, state),
    })
}

/// `delete` frame data for one flag on server-side streams.
pub fn server_delete(flag_key: &str, version: i64) -> Value {
    json!({ "path": format!("/flags/{flag_key}"), "version": version })
}

/// A pre-evaluated flag in the client-side (evalx) data model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFlag {
    pub value: Value,
    pub version: i64,
    pub flag_version: i64,
    pub track_events: bool,
}

impl From<&FlagState> for ClientFlag {
    fn from(state: &FlagState) -> Self {
        Self {
            value: state.value.clone(),
            version: state.version,
            flag_version: state.version,
            track_events: false,
        }
    }
}

/// Client-side evaluation payload: flag key to evaluated flag.
pub fn client_flags(state: &FlagsState) -> BTreeMap<String, ClientFlag> {
    state
        .iter()
        .map(|(key, flag)| (key.clone(), ClientFlag::from(flag)))
        .collect()
}

/// `patch` frame data for one flag on client-side streams.
pub fn client_patch(flag_key: &str, state: &FlagState) -> Value {
    json!({
        "key": flag_key,
        "value": state.value,
        "version": state.version,
        "flagVersion": state.version,
    })
}

/// `delete` frame data for one flag on client-side streams.
pub fn client_delete(flag_key: &str, version: i64) -> Value {
    json!({ "key": flag_key, "version": version })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> FlagsState {
        [
            ("f1".to_string(), FlagState::new(true, 2)),
            ("f2".to_string(), FlagState::new("blue", 5)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_server_flag_shape() {
        let flag = ServerFlag::new("f1", &FlagState::new(json!({"a": 1}), 3));
        let json = serde_json::to_value(&flag).unwrap();

        assert_eq!(json["key"], "f1");
        assert_eq!(json["on"], true);
        assert_eq!(json["fallthrough"], json!({"variation": 0}));
        assert_eq!(json["offVariation"], 0);
        assert_eq!(json["variations"], json!([{"a": 1}]));
        assert_eq!(json["version"], 3);
        assert_eq!(json["salt"], "");
        assert_eq!(json["clientSideAvailability"]["usingMobileKey"], true);
        assert!(json["debugEventsUntilDate"].is_null());
        assert_eq!(json["rules"], json!([]));
    }

    #[test]
    fn test_server_put_frame() {
        let put = server_put(&state());
        assert_eq!(put["path"], "/");
        assert_eq!(put["data"]["flags"]["f2"]["variations"], json!(["blue"]));
        assert_eq!(put["data"]["segments"], json!({}));
    }

    #[test]
    fn test_server_patch_and_delete_frames() {
        let patch = server_patch("f1", &FlagState::new(false, 9));
        assert_eq!(patch["path"], "/flags/f1");
        assert_eq!(patch["data"]["version"], 9);

        let delete = server_delete("f1", 10);
        assert_eq!(delete, json!({"path": "/flags/f1", "version": 10}));
    }

    #[test]
    fn test_client_flags_are_flat() {
        let flags = serde_json::to_value(client_flags(&state())).unwrap();
        assert_eq!(
            flags["f1"],
            json!({"value": true, "version": 2, "flagVersion": 2, "trackEvents": false})
        );

        let patch = client_patch("f2", &FlagState::new("red", 6));
        assert_eq!(patch["key"], "f2");
        assert_eq!(patch["value"], "red");
        assert_eq!(patch["version"], 6);
    }
}
