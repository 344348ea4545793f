//! Cluster state feeder
//!
//! Keeps the in-memory model synchronised with the API server: autoscaler
//! configurations and pods come from watch caches, live usage from the
//! metrics source, and history either from persisted checkpoints or from a
//! Prometheus server at startup.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::{AutoscalerCheckpoint, VerticalAutoscaler};
use crate::error::Error;
use crate::model::{
    AutoscalerId, AutoscalerState, ClusterModel, ContainerState, ContainerUsageSample, PodId,
    PodState, ResourceKind, Resources,
};
use crate::target::TargetSelectorFetcher;

use super::history::HistoryProvider;
use super::metrics::MetricsSource;
use super::oom::extract_ooms;

/// Start a reflector-backed watch cache for a cluster-wide resource and
/// wait for the initial sync
pub async fn watch_store<K>(client: Client) -> Result<Store<K>, Error>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    let api: Api<K> = Api::all(client);
    let (store, writer) = reflector::store();
    let stream = reflector::reflector(
        writer,
        watcher(api, watcher::Config::default()).default_backoff(),
    );
    tokio::spawn(async move {
        let mut applied = stream.applied_objects().boxed();
        while let Some(event) = applied.next().await {
            if let Err(e) = event {
                warn!(error = %e, "watch stream error, backing off");
            }
        }
    });
    store
        .wait_until_ready()
        .await
        .map_err(|e| Error::validation(format!("watch cache failed to sync: {e}")))?;
    Ok(store)
}

/// Synchronises the cluster model with the API server
pub struct ClusterStateFeeder {
    client: Client,
    autoscaler_store: Store<VerticalAutoscaler>,
    pod_store: Store<Pod>,
    selector_fetcher: Arc<dyn TargetSelectorFetcher>,
    metrics_source: Box<dyn MetricsSource>,
}

impl ClusterStateFeeder {
    /// Wire a feeder from its collaborators
    pub fn new(
        client: Client,
        autoscaler_store: Store<VerticalAutoscaler>,
        pod_store: Store<Pod>,
        selector_fetcher: Arc<dyn TargetSelectorFetcher>,
        metrics_source: Box<dyn MetricsSource>,
    ) -> Self {
        Self {
            client,
            autoscaler_store,
            pod_store,
            selector_fetcher,
            metrics_source,
        }
    }

    /// Upsert all autoscaler configurations into the model and drop removed
    /// ones. Aggregates are preserved across config deletion; they are
    /// selector-keyed.
    pub async fn load_autoscalers(&self, model: &mut ClusterModel) {
        let mut live: HashSet<AutoscalerId> = HashSet::new();
        for va in self.autoscaler_store.state() {
            let Some(namespace) = va.metadata.namespace.clone() else {
                continue;
            };
            let id = AutoscalerId {
                namespace: namespace.clone(),
                name: va.name_any(),
            };
            live.insert(id.clone());

            let selector = match &va.spec.target_ref {
                Some(target) => match self.selector_fetcher.fetch(&namespace, target).await {
                    Ok(selector) => Some(selector),
                    Err(e) => {
                        debug!(autoscaler = %id, error = %e, "cannot resolve target selector");
                        None
                    }
                },
                None => None,
            };

            let mut state = AutoscalerState::new(id);
            state.selector = selector;
            state.update_mode = va.update_mode();
            state.resource_policy = va.spec.resource_policy.clone();
            state.created = va.metadata.creation_timestamp.as_ref().map(|t| t.0);
            state.observed_status = va.status.clone().unwrap_or_default();
            model.upsert_autoscaler(state);
        }
        let removed = model.retain_autoscalers(&live);
        for id in removed {
            debug!(autoscaler = %id, "dropped deleted autoscaler from model");
        }
    }

    /// Upsert all pods with their container specs; record fresh OOM kills
    pub fn load_pods(&self, model: &mut ClusterModel) {
        let mut live: HashSet<PodId> = HashSet::new();
        let mut ooms = Vec::new();
        for pod in self.pod_store.state() {
            let Some(namespace) = pod.metadata.namespace.clone() else {
                continue;
            };
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();
            // Terminal pods no longer produce usage and must not count as
            // matching targets.
            if phase == "Succeeded" || phase == "Failed" {
                continue;
            }
            let id = PodId {
                namespace,
                name: pod.name_any(),
            };
            live.insert(id.clone());

            let mut containers = BTreeMap::new();
            for container in pod.spec.iter().flat_map(|s| &s.containers) {
                let request = container
                    .resources
                    .as_ref()
                    .and_then(|r| r.requests.as_ref())
                    .map(|r| Resources::from_quantity_map(r).unwrap_or_default())
                    .unwrap_or_default();
                containers.insert(
                    container.name.clone(),
                    ContainerState {
                        request,
                        ..Default::default()
                    },
                );
            }

            let state = PodState {
                labels: pod.labels().clone(),
                phase,
                start_time: pod
                    .status
                    .as_ref()
                    .and_then(|s| s.start_time.as_ref())
                    .map(|t| t.0),
                containers,
            };
            model.upsert_pod(id, state);
            ooms.extend(extract_ooms(&pod));
        }
        model.retain_pods(&live);

        for oom in ooms {
            if let Err(e) = model.record_oom(&oom.pod_id, &oom.container_name, oom.finished_at) {
                debug!(error = %e, "skipping OOM for untracked container");
            }
        }
    }

    /// Pull one live usage window and fold a CPU and a memory sample per
    /// container into the matching aggregates
    pub async fn load_live_metrics(&self, model: &mut ClusterModel) -> Result<(), Error> {
        let samples = self.metrics_source.container_usage().await?;
        let mut added = 0usize;
        for sample in samples {
            let pod_id = PodId {
                namespace: sample.namespace.clone(),
                name: sample.pod_name.clone(),
            };
            let request = model
                .pod(&pod_id)
                .and_then(|p| p.containers.get(&sample.container_name))
                .map(|c| c.request)
                .unwrap_or_default();

            let cpu = ContainerUsageSample {
                measure_start: sample.timestamp,
                usage: sample.cpu_milli,
                request: request.cpu_milli.unwrap_or(0),
                resource: ResourceKind::Cpu,
            };
            let memory = ContainerUsageSample {
                measure_start: sample.timestamp,
                usage: sample.memory_bytes,
                request: request.memory_bytes.unwrap_or(0),
                resource: ResourceKind::Memory,
            };
            for usage_sample in [cpu, memory] {
                match model.add_usage_sample(&pod_id, &sample.container_name, usage_sample) {
                    Ok(()) => added += 1,
                    Err(_) => {
                        // Metrics for a pod the model does not track (e.g.
                        // memory-saver mode); nothing to aggregate into.
                        break;
                    }
                }
            }
        }
        debug!(samples = added, "loaded live metrics");
        Ok(())
    }

    /// Rehydrate aggregates from persisted checkpoints. Individual corrupt
    /// checkpoints are skipped; their aggregates rebuild from live data.
    pub async fn init_from_checkpoints(&self, model: &mut ClusterModel) -> Result<(), Error> {
        self.load_autoscalers(model).await;
        let api: Api<AutoscalerCheckpoint> = Api::all(self.client.clone());
        let checkpoints = api.list(&ListParams::default()).await?;
        let mut loaded = 0usize;
        for checkpoint in checkpoints.items {
            let Some(namespace) = checkpoint.metadata.namespace.clone() else {
                continue;
            };
            let id = AutoscalerId {
                namespace,
                name: checkpoint.spec.autoscaler_name.clone(),
            };
            let container_name = checkpoint.spec.container_name.clone();
            let Some(status) = &checkpoint.status else {
                continue;
            };
            let options = model.aggregation_options().clone();
            let Some(autoscaler) = model.autoscaler_mut(&id) else {
                debug!(autoscaler = %id, "checkpoint without matching autoscaler");
                continue;
            };
            let mut aggregate = crate::model::AggregateContainerState::new(&options);
            match aggregate.load_checkpoint(status) {
                Ok(()) => {
                    autoscaler
                        .initial_aggregates
                        .insert(container_name, aggregate);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(
                        autoscaler = %id,
                        container = %container_name,
                        error = %e,
                        "skipping unreadable checkpoint"
                    );
                }
            }
        }
        info!(checkpoints = loaded, "initialized model from checkpoints");
        Ok(())
    }

    /// Bootstrap the model from a historical metrics source: one synthesised
    /// sample per returned datapoint
    pub async fn init_from_history_provider(
        &self,
        provider: &dyn HistoryProvider,
        model: &mut ClusterModel,
    ) -> Result<(), Error> {
        self.load_autoscalers(model).await;
        let histories = provider.cluster_history().await?;
        let mut samples_loaded = 0usize;
        for (pod_id, history) in histories {
            let containers: BTreeMap<String, ContainerState> = history
                .container_samples
                .keys()
                .map(|name| (name.clone(), ContainerState::default()))
                .collect();
            model.upsert_pod(
                pod_id.clone(),
                PodState {
                    labels: history.labels.clone(),
                    phase: "Running".to_string(),
                    start_time: None,
                    containers,
                },
            );
            for (container_name, samples) in history.container_samples {
                for sample in samples {
                    let usage_sample = ContainerUsageSample {
                        measure_start: sample.timestamp,
                        usage: sample.value,
                        request: 0,
                        resource: sample.resource,
                    };
                    if model
                        .add_usage_sample(&pod_id, &container_name, usage_sample)
                        .is_ok()
                    {
                        samples_loaded += 1;
                    }
                }
            }
        }
        info!(samples = samples_loaded, "initialized model from history provider");
        Ok(())
    }

    /// Delete checkpoints whose autoscaler no longer exists
    pub async fn garbage_collect_checkpoints(&self, model: &ClusterModel) -> Result<(), Error> {
        let api: Api<AutoscalerCheckpoint> = Api::all(self.client.clone());
        let checkpoints = api.list(&ListParams::default()).await?;
        for checkpoint in checkpoints.items {
            let Some(namespace) = checkpoint.metadata.namespace.clone() else {
                continue;
            };
            let id = AutoscalerId {
                namespace: namespace.clone(),
                name: checkpoint.spec.autoscaler_name.clone(),
            };
            if model.autoscaler(&id).is_some() {
                continue;
            }
            let name = checkpoint.name_any();
            let namespaced: Api<AutoscalerCheckpoint> =
                Api::namespaced(self.client.clone(), &namespace);
            match namespaced.delete(&name, &DeleteParams::default()).await {
                Ok(_) => info!(checkpoint = %name, namespace = %namespace, "deleted orphaned checkpoint"),
                Err(e) => warn!(checkpoint = %name, error = %e, "failed to delete orphaned checkpoint"),
            }
        }
        Ok(())
    }
}
