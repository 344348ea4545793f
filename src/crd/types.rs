//! Supporting types for the VerticalAutoscaler CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Controls whether and how recommendations are applied to running pods
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateMode {
    /// Recommendations are computed but never applied
    Off,
    /// Recommendations are applied only at pod creation
    Initial,
    /// Pods may be evicted so the admission controller can apply
    /// recommendations at recreation
    Recreate,
    /// Currently equivalent to Recreate
    #[default]
    Auto,
}

impl UpdateMode {
    /// Returns true if pods under this mode may be evicted for updates
    pub fn allows_eviction(&self) -> bool {
        matches!(self, Self::Recreate | Self::Auto)
    }
}

impl std::fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "Off"),
            Self::Initial => write!(f, "Initial"),
            Self::Recreate => write!(f, "Recreate"),
            Self::Auto => write!(f, "Auto"),
        }
    }
}

/// Whether a single container is subject to scaling
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ContainerScalingMode {
    /// Scale the container (default)
    #[default]
    Auto,
    /// Leave the container's requests untouched
    Off,
}

/// Reference to the workload object whose pods an autoscaler selects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    /// API version of the target, e.g. `apps/v1`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind of the target, e.g. `Deployment`
    pub kind: String,

    /// Name of the target object (same namespace as the autoscaler)
    pub name: String,
}

/// Pod-level update policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicy {
    /// Update mode for pods matched by this autoscaler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_mode: Option<UpdateMode>,
}

/// Per-container resource policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    /// Name of the container the policy applies to
    pub container_name: String,

    /// Scaling mode for the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ContainerScalingMode>,

    /// Lower bound on the recommended request, per resource
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_allowed: BTreeMap<String, Quantity>,

    /// Upper bound on the recommended request, per resource
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_allowed: BTreeMap<String, Quantity>,
}

/// Resource policy covering all containers of the target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePolicy {
    /// Per-container policies; a policy with container name `*` applies to
    /// all containers without a more specific entry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

/// Container name wildcard matching every container
pub const WILDCARD_CONTAINER: &str = "*";

impl ResourcePolicy {
    /// Returns the policy entry for the named container, falling back to the
    /// wildcard entry when present
    pub fn for_container(&self, name: &str) -> Option<&ContainerResourcePolicy> {
        self.container_policies
            .iter()
            .find(|p| p.container_name == name)
            .or_else(|| {
                self.container_policies
                    .iter()
                    .find(|p| p.container_name == WILDCARD_CONTAINER)
            })
    }
}

/// Recommended resources for a single container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecommendation {
    /// Name of the container
    pub container_name: String,

    /// Recommended request per resource
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target: BTreeMap<String, Quantity>,

    /// Minimum request below which the pod should be updated
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lower_bound: BTreeMap<String, Quantity>,

    /// Maximum request above which the pod should be updated
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub upper_bound: BTreeMap<String, Quantity>,

    /// Target before policy capping, preserved for reporting
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub uncapped_target: BTreeMap<String, Quantity>,
}

/// Recommendation covering all containers of the target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    /// Per-container recommendations, sorted by container name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_recommendations: Vec<ContainerRecommendation>,
}

/// Known condition types reported on the autoscaler status
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    /// The recommender produced a recommendation for the target
    RecommendationProvided,
    /// The target selector currently matches at least one pod
    HasMatchingPods,
    /// The observation history is too short for a confident recommendation
    LowConfidence,
}

/// Condition status values, mirroring core Kubernetes conditions
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
}

/// One observed condition of the autoscaler
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Whether the condition currently holds
    pub status: ConditionStatus,

    /// Last time the condition flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Optional human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
