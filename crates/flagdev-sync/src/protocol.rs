//! Wire types for the upstream management API and evaluation endpoint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use flagdev_core::variation::Variation;
use flagdev_core::{AllFlagsState, FlagMetadata, FlagVariation, FlagsState};

/// Flag definition as listed by the management API. Only the fields needed
/// for variation metadata are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFlag {
    pub key: String,
    #[serde(default)]
    pub variations: Vec<Variation>,
}

impl RemoteFlag {
    pub fn new(key: impl Into<String>, variations: Vec<Variation>) -> Self {
        Self {
            key: key.into(),
            variations,
        }
    }
}

/// Flatten flag definitions into per-flag variation rows.
pub fn variations_of(flags: &[RemoteFlag]) -> Vec<FlagVariation> {
    flags
        .iter()
        .flat_map(|flag| {
            flag.variations
                .iter()
                .map(|v| FlagVariation::new(flag.key.clone(), v.clone()))
        })
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Link {
    pub href: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Links {
    #[serde(default)]
    pub next: Option<Link>,
}

/// One page of `/api/v2/flags/{project}`.
#[derive(Debug, Clone, Deserialize)]
pub struct FlagsPage {
    #[serde(default)]
    pub items: Vec<RemoteFlag>,
    #[serde(rename = "_links", default)]
    pub links: Links,
}

/// Environment as returned by `/api/v2/projects/{project}/environments/{env}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDetail {
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub api_key: String,
}

/// Environment summary exposed by the dev admin API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentsPage {
    #[serde(default)]
    pub items: Vec<Environment>,
}

/// One entry of an evalx response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalxFlag {
    #[serde(default)]
    pub value: Value,
    #[serde(flatten)]
    pub metadata: FlagMetadata,
}

/// Body of `REPORT /sdk/evalx/context`, keyed by flag key.
pub type EvalxResponse = BTreeMap<String, EvalxFlag>;

/// Convert an evalx body into the upstream all-flags shape.
pub fn all_flags_state(response: EvalxResponse) -> AllFlagsState {
    let mut all = AllFlagsState::default();
    for (key, flag) in response {
        all.insert(key, flag.value, flag.metadata);
    }
    all
}

/// Convert an evalx body straight into a flags snapshot.
pub fn flags_state(response: EvalxResponse) -> FlagsState {
    FlagsState::from(all_flags_state(response))
}
