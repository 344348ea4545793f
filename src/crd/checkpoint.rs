//! AutoscalerCheckpoint Custom Resource Definition
//!
//! Checkpoints persist the aggregated usage histograms so a restarted
//! recommender can rehydrate its cluster model instead of starting from an
//! empty history. One checkpoint exists per (autoscaler, container name).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Schema version of the serialised histogram payload. Bumped whenever the
/// bucket layout or the weight encoding changes; checkpoints with a
/// different version are discarded on load.
pub const CHECKPOINT_VERSION: &str = "v3";

/// Specification of an AutoscalerCheckpoint
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "autoscaling.rightsizer.dev",
    version = "v1alpha1",
    kind = "AutoscalerCheckpoint",
    plural = "autoscalercheckpoints",
    shortname = "vacp",
    status = "AutoscalerCheckpointStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerCheckpointSpec {
    /// Name of the VerticalAutoscaler the checkpoint belongs to
    pub autoscaler_name: String,

    /// Name of the container within the autoscaled workload
    pub container_name: String,
}

/// Serialised form of one decaying histogram
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistogramCheckpoint {
    /// Reference timestamp for the exponential decay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_timestamp: Option<DateTime<Utc>>,

    /// Non-zero bucket weights, normalised so the largest is 10000
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bucket_weights: BTreeMap<usize, u32>,

    /// Exact total weight before normalisation
    #[serde(default)]
    pub total_weight: f64,
}

/// Observed state of an AutoscalerCheckpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerCheckpointStatus {
    /// Time of the first sample folded into the aggregate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_sample_start: Option<DateTime<Utc>>,

    /// Time of the most recent sample folded into the aggregate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sample_start: Option<DateTime<Utc>>,

    /// Total number of samples folded into the aggregate
    #[serde(default)]
    pub total_samples_count: u64,

    /// Serialised CPU usage histogram
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_histogram: Option<HistogramCheckpoint>,

    /// Serialised memory peaks histogram
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_histogram: Option<HistogramCheckpoint>,

    /// Schema version of the histogram payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// When the checkpoint was last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}
