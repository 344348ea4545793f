//! Update priority calculation
//!
//! Decides which pods are worth restarting and in what order. Priority is
//! proportional to the fraction by which requests should change: a pod at
//! 10m requesting 20m outranks a pod at 100m requesting 150m. Scale-ups
//! always precede scale-downs.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::input::oom::extract_ooms;
use crate::model::resources::{parse_quantity, ResourceKind};
use crate::recommend::RecommendedResources;

/// Tunables for update eligibility
#[derive(Clone, Debug)]
pub struct UpdateConfig {
    /// Minimum relative resource change that justifies an update
    pub min_change_priority: f64,
    /// Pods younger than this are only updated when outside the
    /// recommended range or after a quick OOM
    pub pod_lifetime_threshold: Duration,
    /// A single-container pod that OOMed within this long after start is
    /// always eligible
    pub evict_after_oom: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            min_change_priority: 0.10,
            pod_lifetime_threshold: Duration::hours(12),
            evict_after_oom: Duration::minutes(10),
        }
    }
}

/// A pod accepted for update, with its computed priority
#[derive(Clone, Debug)]
pub struct PodPriority {
    /// The pod itself
    pub pod: Pod,
    /// Any container's request is outside `[lowerBound, upperBound]`
    pub outside_recommended_range: bool,
    /// Any container's recommended target exceeds its request
    pub scale_up: bool,
    /// Relative difference between total requested and total recommended
    pub resource_diff: f64,
}

/// Accumulates candidate pods and orders them by update priority
pub struct UpdatePriorityCalculator {
    config: UpdateConfig,
    pods: Vec<PodPriority>,
}

impl UpdatePriorityCalculator {
    /// Create a calculator with the given eligibility config
    pub fn new(config: UpdateConfig) -> Self {
        Self {
            config,
            pods: Vec::new(),
        }
    }

    /// Evaluate one pod against its processed recommendation and record it
    /// when eligible for update
    pub fn add_pod(&mut self, pod: &Pod, recommendation: &RecommendedResources, now: DateTime<Utc>) {
        let priority = compute_priority(pod, recommendation);

        let quick_oom = self.is_quick_oom(pod);

        // The update is allowed when the request left the recommended
        // range, after a quick OOM, or for long-lived pods whose drift
        // crossed the change threshold.
        if !priority.outside_recommended_range && !quick_oom {
            let Some(start_time) = pod.status.as_ref().and_then(|s| s.start_time.as_ref()) else {
                debug!(pod = ?pod.metadata.name, "skipping pod without start time");
                return;
            };
            if now < start_time.0 + self.config.pod_lifetime_threshold {
                debug!(pod = ?pod.metadata.name, "skipping short-lived pod within recommended range");
                return;
            }
            if priority.resource_diff < self.config.min_change_priority {
                debug!(
                    pod = ?pod.metadata.name,
                    diff = priority.resource_diff,
                    "skipping pod, resource diff below threshold"
                );
                return;
            }
        }
        self.pods.push(priority);
    }

    /// Pods ordered by priority: scale-ups first, then descending relative
    /// difference
    pub fn sorted_pods(mut self) -> Vec<PodPriority> {
        self.pods.sort_by(|a, b| {
            b.scale_up.cmp(&a.scale_up).then(
                b.resource_diff
                    .partial_cmp(&a.resource_diff)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        self.pods
    }

    fn is_quick_oom(&self, pod: &Pod) -> bool {
        let single_container = pod
            .spec
            .as_ref()
            .map(|s| s.containers.len() == 1)
            .unwrap_or(false);
        if !single_container {
            return false;
        }
        extract_ooms(pod).iter().any(|oom| match oom.started_at {
            Some(started) => oom.finished_at - started < self.config.evict_after_oom,
            None => false,
        })
    }
}

/// Compute the priority terms for one pod. Requests and recommendations
/// are summed per resource across containers before comparing, so one
/// drifted container cannot be masked by its siblings' units.
fn compute_priority(pod: &Pod, recommendation: &RecommendedResources) -> PodPriority {
    let mut outside_recommended_range = false;
    let mut scale_up = false;
    let mut total_request = [0i64; 2];
    let mut total_recommended = [0i64; 2];
    let mut has_recommended = [false; 2];

    for container in pod.spec.iter().flat_map(|s| &s.containers) {
        let Some(rec) = recommendation.get(&container.name) else {
            continue;
        };
        let requests = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref());
        for (slot, kind) in ResourceKind::ALL.into_iter().enumerate() {
            let Some(recommended) = rec.target.get(kind) else {
                continue;
            };
            total_recommended[slot] += recommended;
            has_recommended[slot] = true;

            let request = requests
                .and_then(|r| r.get(kind.name()))
                .and_then(|q| parse_quantity(kind, q).ok());
            match request {
                Some(request) => {
                    total_request[slot] += request;
                    if recommended > request {
                        scale_up = true;
                    }
                    let below = rec.lower_bound.get(kind).is_some_and(|l| request < l);
                    let above = rec.upper_bound.get(kind).is_some_and(|u| request > u);
                    if below || above {
                        outside_recommended_range = true;
                    }
                }
                None => {
                    // A missing request counts as zero: the container runs
                    // unprotected, so any recommendation is a scale-up.
                    scale_up = true;
                    outside_recommended_range = true;
                }
            }
        }
    }

    let mut resource_diff = 0.0;
    for slot in 0..2 {
        if !has_recommended[slot] {
            continue;
        }
        let request = (total_request[slot] as f64).max(1.0);
        resource_diff += (request - total_recommended[slot] as f64).abs() / request;
    }

    PodPriority {
        pod: pod.clone(),
        outside_recommended_range,
        scale_up,
        resource_diff,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resources;
    use crate::recommend::RecommendedContainerResources;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    fn pod(name: &str, cpu_request: Option<&str>, started_secs: i64) -> Pod {
        let requests = cpu_request.map(|cpu| {
            BTreeMap::from([("cpu".to_string(), Quantity(cpu.to_string()))])
        });
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    resources: Some(ResourceRequirements {
                        requests,
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                start_time: Some(Time(t(started_secs))),
                phase: Some("Running".into()),
                ..Default::default()
            }),
        }
    }

    fn recommendation(lower: i64, target: i64, upper: i64) -> RecommendedResources {
        RecommendedResources::from([(
            "app".to_string(),
            RecommendedContainerResources {
                lower_bound: Resources::new(Some(lower), None),
                target: Resources::new(Some(target), None),
                upper_bound: Resources::new(Some(upper), None),
                uncapped_target: Resources::new(Some(target), None),
            },
        )])
    }

    #[test]
    fn scale_ups_precede_scale_downs() {
        let now = t(24 * 3600);
        let mut calc = UpdatePriorityCalculator::new(UpdateConfig::default());

        // P1: request 100m, recommended 300m: scale-up, diff 2.0, outside range.
        calc.add_pod(&pod("p1", Some("100m"), 0), &recommendation(200, 300, 400), now);
        // P2: request 500m, recommended 450m: scale-down, diff 0.1, outside range.
        calc.add_pod(&pod("p2", Some("500m"), 0), &recommendation(440, 450, 460), now);

        let sorted = calc.sorted_pods();
        let names: Vec<&str> = sorted
            .iter()
            .map(|p| p.pod.metadata.name.as_deref().unwrap())
            .collect();
        assert_eq!(names, ["p1", "p2"]);
        assert!(sorted[0].scale_up);
        assert!(!sorted[1].scale_up);
        assert!((sorted[0].resource_diff - 2.0).abs() < 1e-9);
        assert!((sorted[1].resource_diff - 0.1).abs() < 1e-9);
    }

    #[test]
    fn resource_diff_is_non_increasing_within_category() {
        let now = t(24 * 3600);
        let mut calc = UpdatePriorityCalculator::new(UpdateConfig::default());
        calc.add_pod(&pod("small", Some("100m"), 0), &recommendation(10, 150, 160), now);
        calc.add_pod(&pod("large", Some("100m"), 0), &recommendation(10, 400, 500), now);
        calc.add_pod(&pod("mid", Some("100m"), 0), &recommendation(10, 250, 300), now);

        let sorted = calc.sorted_pods();
        let diffs: Vec<f64> = sorted.iter().map(|p| p.resource_diff).collect();
        for pair in diffs.windows(2) {
            assert!(pair[0] >= pair[1], "priority order regressed: {diffs:?}");
        }
    }

    #[test]
    fn in_range_young_pod_is_not_eligible() {
        // 1h old, request inside [lower, upper]: not updated.
        let now = t(3600);
        let mut calc = UpdatePriorityCalculator::new(UpdateConfig::default());
        calc.add_pod(&pod("young", Some("300m"), 0), &recommendation(200, 350, 500), now);
        assert!(calc.sorted_pods().is_empty());
    }

    #[test]
    fn old_pod_with_small_drift_is_not_eligible() {
        // Old enough, but diff 5% < 10% threshold and within range.
        let now = t(24 * 3600);
        let mut calc = UpdatePriorityCalculator::new(UpdateConfig::default());
        calc.add_pod(&pod("stable", Some("400m"), 0), &recommendation(200, 420, 600), now);
        assert!(calc.sorted_pods().is_empty());
    }

    #[test]
    fn outside_range_overrides_age_gate() {
        // 1h old but request above upperBound: eligible immediately.
        let now = t(3600);
        let mut calc = UpdatePriorityCalculator::new(UpdateConfig::default());
        calc.add_pod(&pod("hot", Some("900m"), 0), &recommendation(200, 300, 400), now);
        let sorted = calc.sorted_pods();
        assert_eq!(sorted.len(), 1);
        assert!(sorted[0].outside_recommended_range);
    }

    #[test]
    fn missing_request_counts_as_scale_up() {
        let now = t(3600);
        let mut calc = UpdatePriorityCalculator::new(UpdateConfig::default());
        calc.add_pod(&pod("bare", None, 0), &recommendation(200, 300, 400), now);
        let sorted = calc.sorted_pods();
        assert_eq!(sorted.len(), 1);
        assert!(sorted[0].scale_up);
        assert!(sorted[0].outside_recommended_range);
    }

    #[test]
    fn pod_without_start_time_is_skipped() {
        let now = t(24 * 3600);
        let mut calc = UpdatePriorityCalculator::new(UpdateConfig::default());
        let mut p = pod("nostart", Some("100m"), 0);
        p.status.as_mut().unwrap().start_time = None;
        // In range, so the age gate applies and has nothing to compare.
        calc.add_pod(&p, &recommendation(50, 110, 200), now);
        assert!(calc.sorted_pods().is_empty());
    }
}
