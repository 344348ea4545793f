//! Updater control loop
//!
//! Per tick: enumerate autoscalers whose mode permits eviction, resolve
//! their pod selectors, score matching pods through the priority
//! calculator, and evict the admitted prefix through the eviction API.
//! The eviction subresource honours PodDisruptionBudgets; a budget denial
//! counts as done for this tick and is re-evaluated on the next.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, EvictParams, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::VerticalAutoscaler;
use crate::error::Error;
use crate::model::PodSelector;
use crate::recommend::{capping, logic, LimitRangeCalculator};
use crate::target::TargetSelectorFetcher;
use crate::telemetry::metrics;

use super::eviction::{EvictionConfig, EvictionRateLimiter, PodsEvictionRestriction};
use super::priority::{UpdateConfig, UpdatePriorityCalculator};

/// Tunables of the updater loop
#[derive(Clone, Debug)]
pub struct UpdaterConfig {
    /// Per-group disruption constraints
    pub eviction: EvictionConfig,
    /// Update eligibility thresholds
    pub update: UpdateConfig,
    /// Global evictions per second; ≤ 0 disables the limiter
    pub eviction_rate_limit: f64,
    /// Token bucket burst
    pub eviction_rate_burst: usize,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            eviction: EvictionConfig::default(),
            update: UpdateConfig::default(),
            eviction_rate_limit: -1.0,
            eviction_rate_burst: 1,
        }
    }
}

/// The updater: restarts pods so new recommendations can take effect. It
/// never rewrites pod specs; the admission controller installs the new
/// requests at recreation.
pub struct Updater {
    client: Client,
    selector_fetcher: Arc<dyn TargetSelectorFetcher>,
    limit_ranges: Arc<dyn LimitRangeCalculator>,
    config: UpdaterConfig,
    rate_limiter: Option<EvictionRateLimiter>,
}

impl Updater {
    /// Wire an updater from its collaborators
    pub fn new(
        client: Client,
        selector_fetcher: Arc<dyn TargetSelectorFetcher>,
        limit_ranges: Arc<dyn LimitRangeCalculator>,
        config: UpdaterConfig,
    ) -> Self {
        let rate_limiter =
            EvictionRateLimiter::new(config.eviction_rate_limit, config.eviction_rate_burst);
        Self {
            client,
            selector_fetcher,
            limit_ranges,
            config,
            rate_limiter,
        }
    }

    /// One full tick of the updater
    pub async fn run_once(&mut self) {
        let autoscalers: Api<VerticalAutoscaler> = Api::all(self.client.clone());
        let list = match autoscalers.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "cannot list autoscalers, skipping tick");
                return;
            }
        };

        for va in list
            .items
            .into_iter()
            .filter(|va| va.update_mode().allows_eviction())
        {
            if let Err(e) = self.process_autoscaler(&va).await {
                warn!(
                    autoscaler = %va.name_any(),
                    error = %e,
                    "skipping autoscaler this tick"
                );
            }
        }
    }

    async fn process_autoscaler(&mut self, va: &VerticalAutoscaler) -> Result<(), Error> {
        let Some(namespace) = va.metadata.namespace.clone() else {
            return Ok(());
        };
        let name = va.name_any();
        let Some(target) = &va.spec.target_ref else {
            debug!(autoscaler = %name, "no target reference, nothing to update");
            return Ok(());
        };
        let Some(recommendation) = va.status.as_ref().and_then(|s| s.recommendation.as_ref())
        else {
            debug!(autoscaler = %name, "no recommendation yet");
            return Ok(());
        };

        let selector = self.selector_fetcher.fetch(&namespace, target).await?;
        let pods = self.matching_pods(&namespace, &selector).await?;
        if pods.is_empty() {
            return Ok(());
        }

        // Process the status recommendation through the same capping
        // pipeline the admission controller uses, so both agree on the
        // effective target.
        let raw = logic::from_api_recommendation(recommendation);
        let container_range = self.limit_ranges.container_limit_range(&namespace)?;
        let pod_range = self.limit_ranges.pod_limit_range(&namespace)?;
        let capped = capping::apply(
            &raw,
            va.spec.resource_policy.as_ref(),
            container_range.as_ref(),
            pod_range.as_ref(),
        );

        let now = Utc::now();
        let mut calculator = UpdatePriorityCalculator::new(self.config.update.clone());
        for pod in &pods {
            calculator.add_pod(pod, &capped.containers, now);
        }

        let mut restriction = PodsEvictionRestriction::new(self.config.eviction, &pods);
        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        for candidate in calculator.sorted_pods() {
            if !restriction.can_evict(&candidate.pod) {
                debug!(
                    pod = ?candidate.pod.metadata.name,
                    "disruption check refused eviction"
                );
                metrics().evictions_refused.inc();
                continue;
            }
            if let Some(limiter) = self.rate_limiter.as_mut() {
                limiter.acquire().await;
            }
            let pod_name = candidate.pod.name_any();
            match pod_api.evict(&pod_name, &EvictParams::default()).await {
                Ok(_) => {
                    info!(
                        autoscaler = %name,
                        pod = %pod_name,
                        scale_up = candidate.scale_up,
                        diff = candidate.resource_diff,
                        "evicted pod for update"
                    );
                    metrics().evictions.inc();
                    restriction.on_evicted(&candidate.pod);
                }
                Err(kube::Error::Api(e)) if e.code == 429 => {
                    // Denied by a PodDisruptionBudget; done for this tick,
                    // the next tick re-evaluates.
                    debug!(pod = %pod_name, "eviction denied by disruption budget");
                    metrics().evictions_refused.inc();
                    restriction.on_evicted(&candidate.pod);
                }
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "eviction failed");
                    metrics().evictions_refused.inc();
                }
            }
        }
        Ok(())
    }

    /// List pods in the namespace and keep the live ones matching the
    /// resolved selector
    async fn matching_pods(
        &self,
        namespace: &str,
        selector: &PodSelector,
    ) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default()).await?;
        Ok(pods
            .items
            .into_iter()
            .filter(|pod| {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .unwrap_or_default();
                pod.metadata.deletion_timestamp.is_none()
                    && phase != "Succeeded"
                    && phase != "Failed"
                    && selector.matches(pod.labels())
            })
            .collect())
    }
}
