use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The evaluated value of one flag together with its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagState {
    pub value: Value,
    pub version: i64,
}

impl FlagState {
    pub fn new(value: impl Into<Value>, version: i64) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }
}

/// Snapshot of every flag in a project, keyed by flag key.
///
/// Either the raw state synced from upstream or the state with overrides
/// applied. Snapshots are rebuilt rather than edited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagsState(BTreeMap<String, FlagState>);

impl FlagsState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, flag_key: &str) -> Option<&FlagState> {
        self.0.get(flag_key)
    }

    pub fn contains(&self, flag_key: &str) -> bool {
        self.0.contains_key(flag_key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FlagState)> {
        self.0.iter()
    }

    /// Returns a copy with `flag_key` replaced by `state`.
    pub fn with_flag(&self, flag_key: &str, state: FlagState) -> Self {
        let mut flags = self.0.clone();
        flags.insert(flag_key.to_string(), state);
        Self(flags)
    }
}

impl From<BTreeMap<String, FlagState>> for FlagsState {
    fn from(flags: BTreeMap<String, FlagState>) -> Self {
        Self(flags)
    }
}

impl FromIterator<(String, FlagState)> for FlagsState {
    fn from_iter<I: IntoIterator<Item = (String, FlagState)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for FlagsState {
    type Item = (String, FlagState);
    type IntoIter = std::collections::btree_map::IntoIter<String, FlagState>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a FlagsState {
    type Item = (&'a String, &'a FlagState);
    type IntoIter = std::collections::btree_map::Iter<'a, String, FlagState>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Per-flag metadata reported alongside evaluated values by the upstream SDK.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagMetadata {
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub flag_version: Option<i64>,
    #[serde(default)]
    pub variation: Option<i64>,
}

impl FlagMetadata {
    /// The version a local SDK should see: the flag version when the
    /// upstream reports one, otherwise the evaluation version.
    pub fn effective_version(&self) -> i64 {
        self.flag_version.or(self.version).unwrap_or(0)
    }
}

/// All-flags evaluation result in the upstream SDK's own representation:
/// values and metadata arrive as two parallel maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllFlagsState {
    pub values: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, FlagMetadata>,
}

impl AllFlagsState {
    pub fn insert(&mut self, flag_key: impl Into<String>, value: Value, metadata: FlagMetadata) {
        let flag_key = flag_key.into();
        self.metadata.insert(flag_key.clone(), metadata);
        self.values.insert(flag_key, value);
    }
}

impl From<AllFlagsState> for FlagsState {
    fn from(all: AllFlagsState) -> Self {
        let AllFlagsState { values, metadata } = all;
        values
            .into_iter()
            .map(|(key, value)| {
                let version = metadata
                    .get(&key)
                    .map(FlagMetadata::effective_version)
                    .unwrap_or(0);
                (key, FlagState { value, version })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flags_state_serializes_as_map() {
        let state: FlagsState = [("f1".to_string(), FlagState::new(true, 1))]
            .into_iter()
            .collect();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json, json!({"f1": {"value": true, "version": 1}}));

        let back: FlagsState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_with_flag_leaves_original_untouched() {
        let state: FlagsState = [("f1".to_string(), FlagState::new(true, 1))]
            .into_iter()
            .collect();
        let changed = state.with_flag("f1", FlagState::new(false, 2));

        assert_eq!(state.get("f1").unwrap().value, json!(true));
        assert_eq!(changed.get("f1").unwrap().value, json!(false));
        assert_eq!(changed.get("f1").unwrap().version, 2);
    }

    #[test]
    fn test_all_flags_state_pairs_value_with_version() {
        let mut all = AllFlagsState::default();
        all.insert(
            "f1",
            json!(true),
            FlagMetadata {
                version: Some(7),
                flag_version: Some(3),
                variation: Some(0),
            },
        );
        all.insert(
            "f2",
            json!("blue"),
            FlagMetadata {
                version: Some(4),
                ..Default::default()
            },
        );
        all.values.insert("f3".to_string(), json!(10));

        let state = FlagsState::from(all);
        assert_eq!(state.get("f1"), Some(&FlagState::new(true, 3)));
        assert_eq!(state.get("f2"), Some(&FlagState::new("blue", 4)));
        assert_eq!(state.get("f3"), Some(&FlagState::new(10, 0)));
    }
}
