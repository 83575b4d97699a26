use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flags::FlagState;

/// A local substitution for one flag's value within one project.
///
/// Overrides are never hard-deleted: deleting one deactivates it and bumps
/// its version so SDKs caching by version see the reverted value as a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Override {
    pub project_key: String,
    pub flag_key: String,
    pub value: Value,
    pub active: bool,
    pub version: i64,
}

impl Override {
    /// A new active override at version 1.
    pub fn new(project_key: impl Into<String>, flag_key: impl Into<String>, value: Value) -> Self {
        Self {
            project_key: project_key.into(),
            flag_key: flag_key.into(),
            value,
            active: true,
            version: 1,
        }
    }

    /// Compose this override onto the upstream state of its flag.
    ///
    /// The resulting version is always the sum of both versions, so it only
    /// ever moves forward relative to upstream.
    pub fn apply(&self, base: &FlagState) -> FlagState {
        let value = if self.active {
            self.value.clone()
        } else {
            base.value.clone()
        };
        FlagState {
            value,
            version: base.version + self.version,
        }
    }
}
