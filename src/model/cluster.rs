//! In-memory cluster model
//!
//! The model holds everything the recommender knows about the cluster:
//! pods with their containers, autoscaler configurations, and the
//! aggregated container states. All cross-references are lookups by key
//! against flat maps; there are no back-pointers, so pod churn cannot leave
//! dangling references.
//!
//! The model is mutated only by the recommender's single worker; readers in
//! other processes observe autoscaler status through the API server.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::crd::types::{ResourcePolicy, UpdateMode};
use crate::crd::VerticalAutoscalerStatus;
use crate::error::Error;

use super::aggregation::{AggregateContainerState, AggregationOptions, ContainerUsageSample};
use super::resources::Resources;
use super::selector::PodSelector;

/// Key of a pod in the model
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodId {
    /// Namespace of the pod
    pub namespace: String,
    /// Name of the pod
    pub name: String,
}

/// Key of an autoscaler configuration in the model
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AutoscalerId {
    /// Namespace of the autoscaler
    pub namespace: String,
    /// Name of the autoscaler
    pub name: String,
}

impl std::fmt::Display for AutoscalerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Stable identity of an aggregate: container name plus the owning pod's
/// label set. Pod recreations produce the same key, so history survives
/// restarts; the label map is ordered, so cosmetic reordering cannot mint
/// a new key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggregateStateKey {
    /// Namespace the contributing pods live in
    pub namespace: String,
    /// Container name within the workload
    pub container_name: String,
    /// Canonicalised label set of the contributing pods
    pub labels: BTreeMap<String, String>,
}

/// Per-container state within a tracked pod
#[derive(Clone, Debug, Default)]
pub struct ContainerState {
    /// Declared resource requests
    pub request: Resources,
    /// Most recent memory usage observed, for OOM bump-up
    pub last_memory_usage_bytes: i64,
    /// Most recent OOM already folded into the aggregate, for deduplication
    pub last_oom: Option<DateTime<Utc>>,
}

/// State of one tracked pod
#[derive(Clone, Debug)]
pub struct PodState {
    /// Pod labels, used for selector matching and aggregate keying
    pub labels: BTreeMap<String, String>,
    /// Current lifecycle phase as reported by the API server
    pub phase: String,
    /// When the pod started running
    pub start_time: Option<DateTime<Utc>>,
    /// Containers by name
    pub containers: BTreeMap<String, ContainerState>,
}

/// State of one autoscaler configuration
#[derive(Clone, Debug)]
pub struct AutoscalerState {
    /// Identity of the configuration
    pub id: AutoscalerId,
    /// Pod selector resolved from the target reference; `None` while the
    /// target cannot be resolved
    pub selector: Option<PodSelector>,
    /// Effective update mode
    pub update_mode: UpdateMode,
    /// Per-container policy constraints
    pub resource_policy: Option<ResourcePolicy>,
    /// Creation timestamp of the API object
    pub created: Option<DateTime<Utc>>,
    /// Status most recently observed on the API object
    pub observed_status: VerticalAutoscalerStatus,
    /// When this model last produced a recommendation; monotone per config
    pub recommendation_timestamp: Option<DateTime<Utc>>,
    /// When a checkpoint was last written for this config
    pub checkpoint_written: Option<DateTime<Utc>>,
    /// Aggregates rehydrated from checkpoints at startup, by container name;
    /// merged with live aggregates when recommending
    pub initial_aggregates: BTreeMap<String, AggregateContainerState>,
}

impl AutoscalerState {
    /// A fresh state for the given id with no selector resolved yet
    pub fn new(id: AutoscalerId) -> Self {
        Self {
            id,
            selector: None,
            update_mode: UpdateMode::Auto,
            resource_policy: None,
            created: None,
            observed_status: VerticalAutoscalerStatus::default(),
            recommendation_timestamp: None,
            checkpoint_written: None,
            initial_aggregates: BTreeMap::new(),
        }
    }
}

/// The in-memory cluster state
#[derive(Debug)]
pub struct ClusterModel {
    options: AggregationOptions,
    pods: HashMap<PodId, PodState>,
    autoscalers: BTreeMap<AutoscalerId, AutoscalerState>,
    aggregates: HashMap<AggregateStateKey, AggregateContainerState>,
    /// When set, only pods matched by some autoscaler are tracked
    memory_saver: bool,
}

impl ClusterModel {
    /// Create an empty model
    pub fn new(memory_saver: bool) -> Self {
        Self {
            options: AggregationOptions::default(),
            pods: HashMap::new(),
            autoscalers: BTreeMap::new(),
            aggregates: HashMap::new(),
            memory_saver,
        }
    }

    /// Shared histogram layouts for building compatible aggregates
    pub fn aggregation_options(&self) -> &AggregationOptions {
        &self.options
    }

    /// Number of tracked pods
    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    /// Number of live aggregates
    pub fn aggregate_count(&self) -> usize {
        self.aggregates.len()
    }

    /// Iterate autoscalers in deterministic (sorted) order
    pub fn autoscalers(&self) -> impl Iterator<Item = &AutoscalerState> {
        self.autoscalers.values()
    }

    /// Iterate autoscalers mutably in deterministic order
    pub fn autoscalers_mut(&mut self) -> impl Iterator<Item = &mut AutoscalerState> {
        self.autoscalers.values_mut()
    }

    /// Look up one autoscaler
    pub fn autoscaler(&self, id: &AutoscalerId) -> Option<&AutoscalerState> {
        self.autoscalers.get(id)
    }

    /// Look up one autoscaler mutably
    pub fn autoscaler_mut(&mut self, id: &AutoscalerId) -> Option<&mut AutoscalerState> {
        self.autoscalers.get_mut(id)
    }

    /// Insert or update an autoscaler configuration
    pub fn upsert_autoscaler(&mut self, state: AutoscalerState) {
        match self.autoscalers.get_mut(&state.id) {
            Some(existing) => {
                existing.selector = state.selector;
                existing.update_mode = state.update_mode;
                existing.resource_policy = state.resource_policy;
                existing.created = state.created;
                existing.observed_status = state.observed_status;
            }
            None => {
                self.autoscalers.insert(state.id.clone(), state);
            }
        }
    }

    /// Remove an autoscaler. Its aggregates survive: they are keyed by
    /// container name and pod labels, not by the configuration.
    pub fn delete_autoscaler(&mut self, id: &AutoscalerId) {
        self.autoscalers.remove(id);
    }

    /// Retain only autoscalers present in `live`; returns removed ids
    pub fn retain_autoscalers(&mut self, live: &HashSet<AutoscalerId>) -> Vec<AutoscalerId> {
        let stale: Vec<AutoscalerId> = self
            .autoscalers
            .keys()
            .filter(|id| !live.contains(id))
            .cloned()
            .collect();
        for id in &stale {
            self.autoscalers.remove(id);
        }
        stale
    }

    /// Insert or update a pod with its containers' declared requests.
    /// Creates the matching aggregates so history accrues from the first
    /// sample. In memory-saver mode untracked pods are skipped.
    pub fn upsert_pod(&mut self, id: PodId, state: PodState) {
        if self.memory_saver && !self.pod_has_matching_autoscaler(&id, &state) {
            self.pods.remove(&id);
            return;
        }
        for container_name in state.containers.keys() {
            let key = Self::aggregate_key(&id.namespace, container_name, &state.labels);
            self.aggregates
                .entry(key)
                .or_insert_with(|| AggregateContainerState::new(&self.options));
        }
        self.pods.insert(id, state);
    }

    /// Remove a pod and its containers; aggregates are kept
    pub fn delete_pod(&mut self, id: &PodId) {
        self.pods.remove(id);
    }

    /// Retain only pods present in `live`
    pub fn retain_pods(&mut self, live: &HashSet<PodId>) {
        self.pods.retain(|id, _| live.contains(id));
    }

    /// Look up one pod
    pub fn pod(&self, id: &PodId) -> Option<&PodState> {
        self.pods.get(id)
    }

    /// Fold one usage sample into the aggregate of the given container
    pub fn add_usage_sample(
        &mut self,
        pod_id: &PodId,
        container_name: &str,
        sample: ContainerUsageSample,
    ) -> Result<(), Error> {
        let pod = self
            .pods
            .get_mut(pod_id)
            .ok_or_else(|| Error::validation(format!("unknown pod {pod_id:?}")))?;
        let container = pod.containers.get_mut(container_name).ok_or_else(|| {
            Error::validation(format!(
                "unknown container {container_name:?} in pod {pod_id:?}"
            ))
        })?;
        if sample.resource == super::resources::ResourceKind::Memory {
            container.last_memory_usage_bytes = sample.usage;
        }
        let key = Self::aggregate_key(&pod_id.namespace, container_name, &pod.labels);
        let aggregate = self
            .aggregates
            .entry(key)
            .or_insert_with(|| AggregateContainerState::new(&self.options));
        aggregate.add_sample(&sample);
        Ok(())
    }

    /// Record an OOM kill observed for a container. Deduplicated by finish
    /// time so repeated status syncs do not inflate the histogram.
    pub fn record_oom(
        &mut self,
        pod_id: &PodId,
        container_name: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let pod = self
            .pods
            .get_mut(pod_id)
            .ok_or_else(|| Error::validation(format!("unknown pod {pod_id:?}")))?;
        let container = pod.containers.get_mut(container_name).ok_or_else(|| {
            Error::validation(format!(
                "unknown container {container_name:?} in pod {pod_id:?}"
            ))
        })?;
        if container.last_oom == Some(finished_at) {
            return Ok(());
        }
        container.last_oom = Some(finished_at);
        let last_usage = container
            .last_memory_usage_bytes
            .max(container.request.memory_bytes.unwrap_or(0));
        let key = Self::aggregate_key(&pod_id.namespace, container_name, &pod.labels);
        let aggregate = self
            .aggregates
            .entry(key)
            .or_insert_with(|| AggregateContainerState::new(&self.options));
        aggregate.record_oom(finished_at, last_usage);
        debug!(pod = ?pod_id, container = container_name, "recorded OOM bump-up sample");
        Ok(())
    }

    /// Direct access to an aggregate, used by checkpoint rehydration
    pub fn aggregate_entry(&mut self, key: AggregateStateKey) -> &mut AggregateContainerState {
        self.aggregates
            .entry(key)
            .or_insert_with(|| AggregateContainerState::new(&self.options))
    }

    /// Merged aggregate per container name for the autoscaler's matching
    /// aggregates. Aggregates without live pods still contribute, so a
    /// scaled-to-zero workload keeps its recommendation.
    pub fn aggregates_by_container_name(
        &self,
        autoscaler: &AutoscalerState,
    ) -> BTreeMap<String, AggregateContainerState> {
        let mut merged: BTreeMap<String, AggregateContainerState> =
            autoscaler.initial_aggregates.clone();
        let selector = match &autoscaler.selector {
            Some(selector) => selector,
            None => return merged,
        };
        for (key, aggregate) in &self.aggregates {
            if key.namespace != autoscaler.id.namespace || !selector.matches(&key.labels) {
                continue;
            }
            merged
                .entry(key.container_name.clone())
                .and_modify(|m| m.merge(aggregate))
                .or_insert_with(|| aggregate.clone());
        }
        merged
    }

    /// Pods currently matched by the autoscaler's selector
    pub fn matching_pods(&self, autoscaler: &AutoscalerState) -> Vec<PodId> {
        let selector = match &autoscaler.selector {
            Some(selector) => selector,
            None => return Vec::new(),
        };
        let mut pods: Vec<PodId> = self
            .pods
            .iter()
            .filter(|(id, pod)| {
                id.namespace == autoscaler.id.namespace && selector.matches(&pod.labels)
            })
            .map(|(id, _)| id.clone())
            .collect();
        pods.sort();
        pods
    }

    /// Recompute the set of autoscalers that currently match at least one pod
    pub fn autoscalers_with_matching_pods(&self) -> HashSet<AutoscalerId> {
        self.autoscalers
            .values()
            .filter(|a| !self.matching_pods(a).is_empty())
            .map(|a| a.id.clone())
            .collect()
    }

    /// Drop aggregates that have expired and have no live contributing
    /// container. Returns the number of aggregates removed.
    pub fn garbage_collect_aggregates(&mut self, now: DateTime<Utc>) -> usize {
        let mut live_keys: HashSet<AggregateStateKey> = HashSet::new();
        for (id, pod) in &self.pods {
            for container_name in pod.containers.keys() {
                live_keys.insert(Self::aggregate_key(&id.namespace, container_name, &pod.labels));
            }
        }
        let before = self.aggregates.len();
        self.aggregates
            .retain(|key, aggregate| live_keys.contains(key) || !aggregate.is_expired(now));
        before - self.aggregates.len()
    }

    /// Build the canonical aggregate key for a container
    pub fn aggregate_key(
        namespace: &str,
        container_name: &str,
        labels: &BTreeMap<String, String>,
    ) -> AggregateStateKey {
        AggregateStateKey {
            namespace: namespace.to_string(),
            container_name: container_name.to_string(),
            labels: labels.clone(),
        }
    }

    fn pod_has_matching_autoscaler(&self, id: &PodId, state: &PodState) -> bool {
        self.autoscalers.values().any(|a| {
            a.id.namespace == id.namespace
                && a.selector
                    .as_ref()
                    .is_some_and(|s| s.matches(&state.labels))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::resources::ResourceKind;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pod_id(name: &str) -> PodId {
        PodId {
            namespace: "default".into(),
            name: name.into(),
        }
    }

    fn autoscaler(name: &str, selector: &[(&str, &str)]) -> AutoscalerState {
        let mut state = AutoscalerState::new(AutoscalerId {
            namespace: "default".into(),
            name: name.into(),
        });
        state.selector = Some(PodSelector::from_match_labels(labels(selector)));
        state.created = Some(t(0));
        state
    }

    fn web_pod(name: &str) -> PodState {
        PodState {
            labels: labels(&[("app", "web")]),
            phase: "Running".into(),
            start_time: Some(t(0)),
            containers: BTreeMap::from([(
                "app".to_string(),
                ContainerState {
                    request: Resources::new(Some(500), Some(256 << 20)),
                    ..Default::default()
                },
            )]),
        }
    }

    fn cpu_sample(secs: i64, milli: i64) -> ContainerUsageSample {
        ContainerUsageSample {
            measure_start: t(secs),
            usage: milli,
            request: 500,
            resource: ResourceKind::Cpu,
        }
    }

    #[test]
    fn aggregates_survive_pod_recreation() {
        let mut model = ClusterModel::new(false);
        model.upsert_autoscaler(autoscaler("va", &[("app", "web")]));
        model.upsert_pod(pod_id("web-1"), web_pod("web-1"));
        model
            .add_usage_sample(&pod_id("web-1"), "app", cpu_sample(0, 200))
            .unwrap();

        // Pod restarts under a new name with the same labels.
        model.delete_pod(&pod_id("web-1"));
        model.upsert_pod(pod_id("web-2"), web_pod("web-2"));
        model
            .add_usage_sample(&pod_id("web-2"), "app", cpu_sample(60, 400))
            .unwrap();

        let va = model.autoscaler(&AutoscalerId {
            namespace: "default".into(),
            name: "va".into(),
        });
        let merged = model.aggregates_by_container_name(va.unwrap());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["app"].total_samples_count, 2);
    }

    #[test]
    fn deleted_autoscaler_keeps_aggregates() {
        let mut model = ClusterModel::new(false);
        model.upsert_autoscaler(autoscaler("va", &[("app", "web")]));
        model.upsert_pod(pod_id("web-1"), web_pod("web-1"));
        model
            .add_usage_sample(&pod_id("web-1"), "app", cpu_sample(0, 200))
            .unwrap();

        model.delete_autoscaler(&AutoscalerId {
            namespace: "default".into(),
            name: "va".into(),
        });
        assert_eq!(model.aggregate_count(), 1);

        // Recreating the config immediately sees the old history.
        model.upsert_autoscaler(autoscaler("va", &[("app", "web")]));
        let va = model
            .autoscaler(&AutoscalerId {
                namespace: "default".into(),
                name: "va".into(),
            })
            .unwrap()
            .clone();
        assert_eq!(model.aggregates_by_container_name(&va)["app"].total_samples_count, 1);
    }

    #[test]
    fn matching_is_recomputed_per_pass() {
        let mut model = ClusterModel::new(false);
        model.upsert_autoscaler(autoscaler("va", &[("app", "web")]));
        assert!(model.autoscalers_with_matching_pods().is_empty());

        model.upsert_pod(pod_id("web-1"), web_pod("web-1"));
        assert_eq!(model.autoscalers_with_matching_pods().len(), 1);

        model.delete_pod(&pod_id("web-1"));
        assert!(model.autoscalers_with_matching_pods().is_empty());
    }

    #[test]
    fn memory_saver_skips_unmatched_pods() {
        let mut model = ClusterModel::new(true);
        model.upsert_autoscaler(autoscaler("va", &[("app", "web")]));

        let mut other = web_pod("db-1");
        other.labels = labels(&[("app", "db")]);
        model.upsert_pod(pod_id("db-1"), other);
        assert_eq!(model.pod_count(), 0);

        model.upsert_pod(pod_id("web-1"), web_pod("web-1"));
        assert_eq!(model.pod_count(), 1);
    }

    #[test]
    fn oom_is_deduplicated_by_finish_time() {
        let mut model = ClusterModel::new(false);
        model.upsert_pod(pod_id("web-1"), web_pod("web-1"));
        model.record_oom(&pod_id("web-1"), "app", t(100)).unwrap();
        model.record_oom(&pod_id("web-1"), "app", t(100)).unwrap();

        let key = ClusterModel::aggregate_key("default", "app", &labels(&[("app", "web")]));
        let aggregate = model.aggregate_entry(key);
        // A single window peak from the single distinct OOM.
        let p99 = aggregate.memory_percentile(0.99).unwrap();
        let p01 = aggregate.memory_percentile(0.01).unwrap();
        assert_eq!(p99, p01);
    }

    #[test]
    fn gc_keeps_fresh_and_contributing_aggregates() {
        let mut model = ClusterModel::new(false);
        model.upsert_pod(pod_id("web-1"), web_pod("web-1"));
        model
            .add_usage_sample(&pod_id("web-1"), "app", cpu_sample(0, 200))
            .unwrap();

        // Orphaned aggregate with old samples.
        let orphan_key = ClusterModel::aggregate_key("default", "gone", &labels(&[("app", "old")]));
        model
            .aggregate_entry(orphan_key.clone())
            .add_sample(&cpu_sample(0, 100));

        // Within retention nothing is collected.
        assert_eq!(model.garbage_collect_aggregates(t(3600)), 0);

        // Past retention only the orphan goes; the live pod's aggregate
        // stays even though its samples are stale.
        let removed = model.garbage_collect_aggregates(t(30 * 86_400));
        assert_eq!(removed, 1);
        assert_eq!(model.aggregate_count(), 1);
    }

    #[test]
    fn unknown_pod_or_container_is_an_error() {
        let mut model = ClusterModel::new(false);
        assert!(model
            .add_usage_sample(&pod_id("ghost"), "app", cpu_sample(0, 100))
            .is_err());
        model.upsert_pod(pod_id("web-1"), web_pod("web-1"));
        assert!(model
            .add_usage_sample(&pod_id("web-1"), "ghost", cpu_sample(0, 100))
            .is_err());
    }
}
