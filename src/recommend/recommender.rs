//! Recommender control loop
//!
//! One `run_once` iteration loads configs, pods and live metrics into the
//! model, computes and publishes recommendations, writes checkpoints under
//! the iteration deadline, and garbage-collects stale state. Iterations are
//! driven by a fixed-period ticker and never overlap; a long iteration just
//! delays the next.

use std::time::{Duration, Instant};

use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointWriter;
use crate::crd::types::{
    ConditionStatus, ConditionType, ContainerRecommendation, Recommendation,
};
use crate::crd::{VerticalAutoscaler, VerticalAutoscalerStatus};
use crate::error::Error;
use crate::input::{ClusterStateFeeder, HistoryProvider};
use crate::model::{AutoscalerId, ClusterModel};
use crate::telemetry::{metrics, StepTimer};

use super::capping::{self, CappedRecommendation};
use super::logic::{PodResourceRecommender, RecommendedResources};

/// How often expired aggregates are garbage collected
const AGGREGATE_GC_INTERVAL: Duration = Duration::from_secs(3600);

/// Observation history below this many days flags `LowConfidence`
const LOW_CONFIDENCE_DAYS: f64 = 1.0;

/// Tunables of the recommender loop
#[derive(Clone, Debug)]
pub struct RecommenderConfig {
    /// Budget for the checkpoint write phase of one iteration
    pub checkpoints_timeout: Duration,
    /// Minimum checkpoints written per iteration, regardless of deadline
    pub min_checkpoints: usize,
    /// How often orphaned checkpoints are garbage collected
    pub checkpoints_gc_interval: Duration,
    /// Whether checkpoints are written at all (off under Prometheus storage)
    pub use_checkpoints: bool,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            checkpoints_timeout: Duration::from_secs(60),
            min_checkpoints: 10,
            checkpoints_gc_interval: Duration::from_secs(600),
            use_checkpoints: true,
        }
    }
}

/// The recommender: owns the cluster model and drives one iteration at a
/// time. The model is mutated only here, on a single logical worker.
pub struct Recommender {
    client: Client,
    feeder: ClusterStateFeeder,
    model: ClusterModel,
    checkpoint_writer: CheckpointWriter,
    logic: PodResourceRecommender,
    config: RecommenderConfig,
    last_checkpoint_gc: Option<Instant>,
    last_aggregate_gc: Option<Instant>,
}

impl Recommender {
    /// Wire a recommender from its collaborators
    pub fn new(
        client: Client,
        feeder: ClusterStateFeeder,
        model: ClusterModel,
        config: RecommenderConfig,
    ) -> Self {
        Self {
            checkpoint_writer: CheckpointWriter::new(client.clone()),
            client,
            feeder,
            model,
            logic: PodResourceRecommender::default(),
            config,
            last_checkpoint_gc: None,
            last_aggregate_gc: None,
        }
    }

    /// Rehydrate the model from persisted checkpoints
    pub async fn init_from_checkpoints(&mut self) -> Result<(), Error> {
        self.feeder.init_from_checkpoints(&mut self.model).await
    }

    /// Bootstrap the model from a historical metrics source
    pub async fn init_from_history(
        &mut self,
        provider: &dyn HistoryProvider,
    ) -> Result<(), Error> {
        self.feeder
            .init_from_history_provider(provider, &mut self.model)
            .await
    }

    /// One full iteration of the control loop
    pub async fn run_once(&mut self) {
        let iteration_start = tokio::time::Instant::now();
        let checkpoint_deadline = iteration_start + self.config.checkpoints_timeout;

        {
            let _timer = StepTimer::start("load_autoscalers");
            self.feeder.load_autoscalers(&mut self.model).await;
        }
        {
            let _timer = StepTimer::start("load_pods");
            self.feeder.load_pods(&mut self.model);
        }
        {
            let _timer = StepTimer::start("load_metrics");
            if let Err(e) = self.feeder.load_live_metrics(&mut self.model).await {
                warn!(error = %e, "skipping live metrics this iteration");
            }
        }
        debug!(
            pods = self.model.pod_count(),
            autoscalers = self.model.autoscalers().count(),
            "model synchronised"
        );
        {
            let _timer = StepTimer::start("update_autoscalers");
            self.update_autoscalers().await;
        }
        if self.config.use_checkpoints {
            let _timer = StepTimer::start("maintain_checkpoints");
            let written = self
                .checkpoint_writer
                .store_checkpoints(
                    &mut self.model,
                    Utc::now(),
                    self.config.min_checkpoints,
                    checkpoint_deadline,
                )
                .await;
            metrics().checkpoints_written.inc_by(written as u64);

            if self
                .last_checkpoint_gc
                .is_none_or(|last| last.elapsed() > self.config.checkpoints_gc_interval)
            {
                self.last_checkpoint_gc = Some(Instant::now());
                if let Err(e) = self.feeder.garbage_collect_checkpoints(&self.model).await {
                    warn!(error = %e, "checkpoint garbage collection failed");
                }
            }
        }
        {
            let _timer = StepTimer::start("garbage_collect");
            if self
                .last_aggregate_gc
                .is_none_or(|last| last.elapsed() > AGGREGATE_GC_INTERVAL)
            {
                self.last_aggregate_gc = Some(Instant::now());
                let removed = self.model.garbage_collect_aggregates(Utc::now());
                if removed > 0 {
                    info!(removed, "garbage collected aggregate container states");
                }
            }
        }

        metrics()
            .aggregate_states
            .set(self.model.aggregate_count() as i64);
        metrics()
            .autoscalers
            .set(self.model.autoscalers().count() as i64);
    }

    /// Compute recommendations and publish them onto autoscaler statuses,
    /// writing only when the status actually changed
    async fn update_autoscalers(&mut self) {
        let now = Utc::now();
        let with_pods = self.model.autoscalers_with_matching_pods();
        let ids: Vec<AutoscalerId> = self.model.autoscalers().map(|a| a.id.clone()).collect();

        for id in ids {
            let Some(autoscaler) = self.model.autoscaler(&id) else {
                continue;
            };
            let aggregates = self.model.aggregates_by_container_name(autoscaler);
            let raw = self.logic.recommend(&aggregates);
            // The recommender caps against the user policy; the namespace
            // LimitRange is applied where the pod is known, at admission.
            let capped = capping::apply(&raw, autoscaler.resource_policy.as_ref(), None, None);

            let has_matching_pods = with_pods.contains(&id);
            self.check_matching_consistency(&id, &raw, has_matching_pods);

            let max_observation_days = aggregates
                .values()
                .map(|a| a.observation_days())
                .fold(0.0, f64::max);

            let mut status = autoscaler.observed_status.clone();
            let recommendation = to_api_recommendation(&capped, &raw);
            let provided = !recommendation.container_recommendations.is_empty();
            if provided {
                status.recommendation = Some(recommendation);
            }
            status.set_condition(
                ConditionType::RecommendationProvided,
                if provided {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
                None,
                now,
            );
            status.set_condition(
                ConditionType::HasMatchingPods,
                if has_matching_pods {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
                (!has_matching_pods).then(|| "no pods match this autoscaler".to_string()),
                now,
            );
            if provided && max_observation_days < LOW_CONFIDENCE_DAYS {
                status.set_condition(
                    ConditionType::LowConfidence,
                    ConditionStatus::True,
                    Some(format!(
                        "observation history of {max_observation_days:.2} days is below {LOW_CONFIDENCE_DAYS} day(s)"
                    )),
                    now,
                );
            } else if status.condition(ConditionType::LowConfidence).is_some() {
                status.set_condition(ConditionType::LowConfidence, ConditionStatus::False, None, now);
            }

            let observed = autoscaler.observed_status.clone();
            if status == observed {
                continue;
            }
            match self.patch_status(&id, &status).await {
                Ok(()) => {
                    if let Some(state) = self.model.autoscaler_mut(&id) {
                        state.observed_status = status;
                        // Monotone per config, even if the clock stepped back.
                        state.recommendation_timestamp =
                            Some(state.recommendation_timestamp.map_or(now, |p| p.max(now)));
                    }
                }
                Err(e) => warn!(autoscaler = %id, error = %e, "failed to update status"),
            }
        }
    }

    /// The matching-pods condition and the live pod query can briefly
    /// disagree during watch races; log and count, never fail.
    fn check_matching_consistency(
        &self,
        id: &AutoscalerId,
        raw: &RecommendedResources,
        has_matching_pods: bool,
    ) {
        let Some(autoscaler) = self.model.autoscaler(id) else {
            return;
        };
        let observed_matching =
            autoscaler.observed_status.condition(ConditionType::HasMatchingPods)
                == Some(ConditionStatus::True);
        if observed_matching && !has_matching_pods && !raw.is_empty() {
            error!(
                autoscaler = %id,
                aggregates = raw.len(),
                "aggregated states and matching pods disagree; proceeding with stale aggregates"
            );
            metrics().model_inconsistencies.inc();
        }
    }

    async fn patch_status(
        &self,
        id: &AutoscalerId,
        status: &VerticalAutoscalerStatus,
    ) -> Result<(), Error> {
        let api: Api<VerticalAutoscaler> = Api::namespaced(self.client.clone(), &id.namespace);
        api.patch_status(
            &id.name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
        Ok(())
    }

    /// Read access to the model, for bootstrap assertions and tests
    pub fn model(&self) -> &ClusterModel {
        &self.model
    }
}

/// Convert a capped recommendation into the API status form, restoring the
/// raw target as `uncappedTarget`
fn to_api_recommendation(
    capped: &CappedRecommendation,
    raw: &RecommendedResources,
) -> Recommendation {
    let mut container_recommendations = Vec::with_capacity(capped.containers.len());
    for (container_name, rec) in &capped.containers {
        let uncapped = raw
            .get(container_name)
            .map(|r| r.uncapped_target)
            .unwrap_or(rec.uncapped_target);
        container_recommendations.push(ContainerRecommendation {
            container_name: container_name.clone(),
            target: rec.target.to_quantity_map(),
            lower_bound: rec.lower_bound.to_quantity_map(),
            upper_bound: rec.upper_bound.to_quantity_map(),
            uncapped_target: uncapped.to_quantity_map(),
        });
    }
    Recommendation {
        container_recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resources;
    use crate::recommend::logic::RecommendedContainerResources;
    use std::collections::BTreeMap;

    #[test]
    fn api_recommendation_preserves_uncapped_target() {
        let raw = RecommendedResources::from([(
            "app".to_string(),
            RecommendedContainerResources {
                lower_bound: Resources::new(Some(10), None),
                target: Resources::new(Some(50), None),
                upper_bound: Resources::new(Some(2000), None),
                uncapped_target: Resources::new(Some(50), None),
            },
        )]);
        let mut capped_containers = raw.clone();
        capped_containers.get_mut("app").unwrap().target = Resources::new(Some(100), None);
        let capped = CappedRecommendation {
            containers: capped_containers,
            annotations: BTreeMap::new(),
        };

        let api = to_api_recommendation(&capped, &raw);
        assert_eq!(api.container_recommendations.len(), 1);
        let rec = &api.container_recommendations[0];
        assert_eq!(rec.target.get("cpu").unwrap().0, "100m");
        assert_eq!(rec.uncapped_target.get("cpu").unwrap().0, "50m");
    }

    #[test]
    fn empty_capped_recommendation_maps_to_empty_status() {
        let api = to_api_recommendation(&CappedRecommendation::default(), &BTreeMap::new());
        assert!(api.container_recommendations.is_empty());
    }
}
