//! Label selectors used by strategy steps to pick targets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Selects workloads by label.
///
/// All `match_labels` entries and all `match_expressions` must hold. An
/// empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl LabelSelector {
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    /// Whether `labels` satisfies this selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_ok = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));

        labels_ok && self.match_expressions.iter().all(|req| req.matches(labels))
    }

    /// Check operator/value combinations.
    pub fn validate(&self) -> Result<(), String> {
        for req in &self.match_expressions {
            match req.operator {
                SelectorOperator::In | SelectorOperator::NotIn if req.values.is_empty() => {
                    return Err(format!(
                        "selector on {:?}: operator {:?} requires values",
                        req.key, req.operator
                    ));
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist
                    if !req.values.is_empty() =>
                {
                    return Err(format!(
                        "selector on {:?}: operator {:?} takes no values",
                        req.key, req.operator
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl LabelSelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_all() {
        assert!(LabelSelector::default().matches(&labels(&[("app", "x")])));
        assert!(LabelSelector::default().matches(&BTreeMap::new()));
    }

    #[test]
    fn match_labels_must_all_hold() {
        let sel = LabelSelector::from_labels([("app", "web"), ("tier", "fe")]);
        assert!(sel.matches(&labels(&[("app", "web"), ("tier", "fe"), ("x", "y")])));
        assert!(!sel.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn expressions() {
        let sel = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![
                LabelSelectorRequirement {
                    key: "zone".into(),
                    operator: SelectorOperator::In,
                    values: vec!["a".into(), "b".into()],
                },
                LabelSelectorRequirement {
                    key: "legacy".into(),
                    operator: SelectorOperator::DoesNotExist,
                    values: vec![],
                },
            ],
        };
        assert!(sel.matches(&labels(&[("zone", "a")])));
        assert!(!sel.matches(&labels(&[("zone", "c")])));
        assert!(!sel.matches(&labels(&[("zone", "b"), ("legacy", "true")])));
    }

    #[test]
    fn not_in_matches_missing_key() {
        let sel = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![LabelSelectorRequirement {
                key: "env".into(),
                operator: SelectorOperator::NotIn,
                values: vec!["prod".into()],
            }],
        };
        assert!(sel.matches(&BTreeMap::new()));
        assert!(!sel.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn validate_rejects_bad_combinations() {
        let mut sel = LabelSelector::default();
        sel.match_expressions.push(LabelSelectorRequirement {
            key: "k".into(),
            operator: SelectorOperator::In,
            values: vec![],
        });
        assert!(sel.validate().is_err());

        sel.match_expressions[0].operator = SelectorOperator::Exists;
        assert!(sel.validate().is_ok());
    }
}
