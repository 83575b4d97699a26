use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use flagdev_core::variation::{group_by_flag, Variation};
use flagdev_core::{Context, FlagsState, Override, Project};

/// Override as carried in an export file; the owning keys are implied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedOverride {
    pub value: Value,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default = "default_version")]
    pub version: i64,
}

fn default_active() -> bool {
    true
}

fn default_version() -> i64 {
    1
}

impl From<&Override> for ExportedOverride {
    fn from(ovr: &Override) -> Self {
        Self {
            value: ovr.value.clone(),
            active: ovr.active,
            version: ovr.version,
        }
    }
}

impl ExportedOverride {
    pub fn into_override(self, project_key: &str, flag_key: &str) -> Override {
        Override {
            project_key: project_key.to_string(),
            flag_key: flag_key.to_string(),
            value: self.value,
            active: self.active,
            version: self.version,
        }
    }
}

/// Portable project document, read by import and written by export.
///
/// `flagsState` holds the raw upstream state; overrides travel separately
/// so an import reproduces the same effective state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectExport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_environment_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags_state: Option<FlagsState>,
    /// Variations grouped by flag key.
    #[serde(default)]
    pub available_variations: BTreeMap<String, Vec<Variation>>,
    #[serde(default)]
    pub overrides: BTreeMap<String, ExportedOverride>,
}

impl ProjectExport {
    pub fn new(project: &Project, overrides: &[Override]) -> Self {
        Self {
            source_environment_key: Some(project.source_environment_key.clone()),
            context: Some(project.context.clone()),
            flags_state: Some(project.all_flags_state.clone()),
            available_variations: group_by_flag(&project.available_variations),
            overrides: overrides
                .iter()
                .map(|o| (o.flag_key.clone(), ExportedOverride::from(o)))
                .collect(),
        }
    }
}
