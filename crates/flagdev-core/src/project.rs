use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::flags::FlagsState;
use crate::variation::FlagVariation;

/// A local mirror of one upstream environment's flag state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub key: String,
    pub source_environment_key: String,
    pub context: Context,
    pub last_sync_time: DateTime<Utc>,
    pub all_flags_state: FlagsState,
    #[serde(default)]
    pub available_variations: Vec<FlagVariation>,
}

impl Project {
    pub fn new(
        key: impl Into<String>,
        source_environment_key: impl Into<String>,
        context: Context,
        all_flags_state: FlagsState,
    ) -> Self {
        Self {
            key: key.into(),
            source_environment_key: source_environment_key.into(),
            context,
            last_sync_time: Utc::now(),
            all_flags_state,
            available_variations: Vec::new(),
        }
    }

    pub fn with_variations(mut self, variations: Vec<FlagVariation>) -> Self {
        self.available_variations = variations;
        self
    }
}
