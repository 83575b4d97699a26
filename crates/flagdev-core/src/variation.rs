use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One possible value of a flag, mirrored from the management API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub value: Value,
}

/// A variation tagged with the flag it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagVariation {
    pub flag_key: String,
    #[serde(flatten)]
    pub variation: Variation,
}

impl FlagVariation {
    pub fn new(flag_key: impl Into<String>, variation: Variation) -> Self {
        Self {
            flag_key: flag_key.into(),
            variation,
        }
    }
}

/// Group flat variation rows by flag key, keeping row order per flag.
pub fn group_by_flag(variations: &[FlagVariation]) -> BTreeMap<String, Vec<Variation>> {
    let mut grouped: BTreeMap<String, Vec<Variation>> = BTreeMap::new();
    for fv in variations {
        grouped
            .entry(fv.flag_key.clone())
            .or_default()
            .push(fv.variation.clone());
    }
    grouped
}

/// Flatten a per-flag variation map back into rows.
pub fn flatten(grouped: BTreeMap<String, Vec<Variation>>) -> Vec<FlagVariation> {
    grouped
        .into_iter()
        .flat_map(|(flag_key, variations)| {
            variations
                .into_iter()
                .map(move |variation| FlagVariation::new(flag_key.clone(), variation))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn variation(id: &str, value: Value) -> Variation {
        Variation {
            id: id.to_string(),
            name: None,
            description: None,
            value,
        }
    }

    #[test]
    fn test_variation_wire_shape() {
        let v = Variation {
            id: "v1".to_string(),
            name: Some("On".to_string()),
            description: None,
            value: json!(true),
        };
        assert_eq!(
            serde_json::to_value(&v).unwrap(),
            json!({"_id": "v1", "name": "On", "value": true})
        );
    }

    #[test]
    fn test_group_by_flag() {
        let rows = vec![
            FlagVariation::new("f1", variation("a", json!(true))),
            FlagVariation::new("f2", variation("c", json!("x"))),
            FlagVariation::new("f1", variation("b", json!(false))),
        ];
        let grouped = group_by_flag(&rows);

        assert_eq!(grouped.len(), 2);
        let ids: Vec<_> = grouped["f1"].iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(flatten(grouped).len(), 3);
    }
}
