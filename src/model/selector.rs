//! Pod label selector matching
//!
//! Selectors resolved from workload objects are evaluated against pod label
//! sets inside the cluster model, so matching must not require API calls.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::error::Error;

/// Operator of one selector requirement
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectorOperator {
    /// Label value must be one of the listed values
    In,
    /// Label value must not be one of the listed values
    NotIn,
    /// Label key must be present
    Exists,
    /// Label key must be absent
    DoesNotExist,
}

impl SelectorOperator {
    fn matches(&self, value: Option<&str>, values: &[String]) -> bool {
        match self {
            Self::In => value.is_some_and(|v| values.iter().any(|x| x == v)),
            Self::NotIn => value.is_none_or(|v| !values.iter().any(|x| x == v)),
            Self::Exists => value.is_some(),
            Self::DoesNotExist => value.is_none(),
        }
    }
}

/// One expression of a pod selector
#[derive(Clone, Debug, PartialEq)]
pub struct SelectorRequirement {
    /// The label key the requirement applies to
    pub key: String,
    /// Relationship between the label and the values
    pub operator: SelectorOperator,
    /// Values for `In`/`NotIn`; empty for the existence operators
    pub values: Vec<String>,
}

impl SelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key).map(String::as_str);
        self.operator.matches(value, &self.values)
    }
}

/// A resolved pod selector: all parts must match
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodSelector {
    /// Exact-match label pairs
    pub match_labels: BTreeMap<String, String>,
    /// Expression requirements
    pub match_expressions: Vec<SelectorRequirement>,
}

impl PodSelector {
    /// Selector requiring the given exact label pairs
    pub fn from_match_labels(match_labels: BTreeMap<String, String>) -> Self {
        Self {
            match_labels,
            match_expressions: Vec::new(),
        }
    }

    /// Convert a Kubernetes `LabelSelector` into a resolvable form
    pub fn from_label_selector(selector: &LabelSelector) -> Result<Self, Error> {
        let mut out = Self {
            match_labels: selector.match_labels.clone().unwrap_or_default(),
            match_expressions: Vec::new(),
        };
        for expr in selector.match_expressions.iter().flatten() {
            let operator = match expr.operator.as_str() {
                "In" => SelectorOperator::In,
                "NotIn" => SelectorOperator::NotIn,
                "Exists" => SelectorOperator::Exists,
                "DoesNotExist" => SelectorOperator::DoesNotExist,
                other => {
                    return Err(Error::validation(format!(
                        "unknown selector operator {other:?}"
                    )))
                }
            };
            out.match_expressions.push(SelectorRequirement {
                key: expr.key.clone(),
                operator,
                values: expr.values.clone().unwrap_or_default(),
            });
        }
        Ok(out)
    }

    /// Parse the equality-based selector string reported by the scale
    /// subresource, e.g. `app=worker,tier=backend`
    pub fn parse_equality(selector: &str) -> Result<Self, Error> {
        let mut match_labels = BTreeMap::new();
        for part in selector.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::target(format!("unparseable selector part {part:?}")))?;
            match_labels.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self::from_match_labels(match_labels))
    }

    /// True when every label pair and expression matches
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
        self.match_expressions.iter().all(|e| e.matches(labels))
    }

    /// An empty selector matches every pod
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }
}
