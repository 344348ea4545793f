//! Recommendation capping pipeline
//!
//! Takes a raw recommendation and clamps it against the user's per-container
//! policy and the namespace LimitRange, in a fixed order:
//!
//! 1. containers with scaling mode `Off` are dropped,
//! 2. bounds are clamped into `[minAllowed, maxAllowed]`,
//! 3. bounds are clamped into the container LimitRange,
//! 4. targets are scaled down together when the pod LimitRange maximum
//!    would be exceeded.
//!
//! Every adjustment is recorded as a human-readable annotation so the
//! admission controller and status consumers can explain the result.
//! `uncapped_target` is never modified.

use std::collections::BTreeMap;

use crate::crd::types::{ContainerScalingMode, ResourcePolicy};
use crate::model::{ResourceKind, Resources};

use super::limit_range::EffectiveLimitRange;
use super::logic::RecommendedResources;

/// Per-container annotations explaining which constraints bound the result
pub type CappingAnnotations = BTreeMap<String, Vec<String>>;

/// A recommendation after the capping pipeline
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CappedRecommendation {
    /// Capped per-container recommendations
    pub containers: RecommendedResources,
    /// Which constraints were applied, per container
    pub annotations: CappingAnnotations,
}

/// Run the capping pipeline over a raw recommendation
pub fn apply(
    raw: &RecommendedResources,
    policy: Option<&ResourcePolicy>,
    container_limit_range: Option<&EffectiveLimitRange>,
    pod_limit_range: Option<&EffectiveLimitRange>,
) -> CappedRecommendation {
    let mut result = CappedRecommendation::default();

    for (container_name, recommendation) in raw {
        let container_policy = policy.and_then(|p| p.for_container(container_name));
        if container_policy.and_then(|p| p.mode) == Some(ContainerScalingMode::Off) {
            continue;
        }

        let mut capped = recommendation.clone();
        let mut annotations = Vec::new();

        let (policy_min, policy_max) = match container_policy {
            Some(p) => (
                Resources::from_quantity_map(&p.min_allowed).unwrap_or_default(),
                Resources::from_quantity_map(&p.max_allowed).unwrap_or_default(),
            ),
            None => (Resources::default(), Resources::default()),
        };

        for kind in ResourceKind::ALL {
            if let Some(min) = policy_min.get(kind) {
                if clamp_bounds_min(&mut capped, kind, min) {
                    annotations.push(format!("{kind} capped to minAllowed"));
                }
            }
            if let Some(max) = policy_max.get(kind) {
                if clamp_bounds_max(&mut capped, kind, max) {
                    annotations.push(format!("{kind} capped to maxAllowed"));
                }
            }
            if let Some(range) = container_limit_range {
                if let Some(min) = range.min.get(kind) {
                    if clamp_bounds_min(&mut capped, kind, min) {
                        annotations.push(format!("{kind} capped to fit limit range min"));
                    }
                }
                if let Some(max) = range.max.get(kind) {
                    if clamp_bounds_max(&mut capped, kind, max) {
                        annotations.push(format!("{kind} capped to fit limit range max"));
                    }
                }
            }
            // Clamping is monotone: an upper bound pushed below the lower
            // bound is raised back to it.
            if let (Some(lower), Some(upper)) =
                (capped.lower_bound.get(kind), capped.upper_bound.get(kind))
            {
                if upper < lower {
                    capped.upper_bound.set(kind, lower);
                }
            }
        }

        if !annotations.is_empty() {
            result
                .annotations
                .insert(container_name.clone(), annotations);
        }
        result.containers.insert(container_name.clone(), capped);
    }

    if let Some(range) = pod_limit_range {
        scale_to_pod_limit_range(&mut result, range);
    }

    result
}

/// Scale every container's target down by a common factor so the pod-level
/// sum fits the pod LimitRange maximum
fn scale_to_pod_limit_range(result: &mut CappedRecommendation, range: &EffectiveLimitRange) {
    for kind in ResourceKind::ALL {
        let Some(max_total) = range.max.get(kind) else {
            continue;
        };
        let total: i64 = result
            .containers
            .values()
            .filter_map(|c| c.target.get(kind))
            .sum();
        if total <= max_total || total == 0 {
            continue;
        }
        let factor = max_total as f64 / total as f64;
        let names: Vec<String> = result.containers.keys().cloned().collect();
        for name in names {
            let container = result
                .containers
                .get_mut(&name)
                .unwrap_or_else(|| unreachable!("key taken from the map"));
            if let Some(target) = container.target.get(kind) {
                let scaled = ((target as f64) * factor).floor() as i64;
                container.target.set(kind, scaled);
                // Keep lower ≤ target after scaling down.
                if let Some(lower) = container.lower_bound.get(kind) {
                    container.lower_bound.set(kind, lower.min(scaled));
                }
                result
                    .annotations
                    .entry(name)
                    .or_default()
                    .push(format!("pod total {kind} scaled down to fit pod limit range"));
            }
        }
    }
}

fn clamp_bounds_min(
    rec: &mut super::logic::RecommendedContainerResources,
    kind: ResourceKind,
    min: i64,
) -> bool {
    let mut changed = false;
    for bounds in [&mut rec.lower_bound, &mut rec.target, &mut rec.upper_bound] {
        if let Some(value) = bounds.get(kind) {
            if value < min {
                bounds.set(kind, min);
                changed = true;
            }
        }
    }
    changed
}

fn clamp_bounds_max(
    rec: &mut super::logic::RecommendedContainerResources,
    kind: ResourceKind,
    max: i64,
) -> bool {
    let mut changed = false;
    for bounds in [&mut rec.lower_bound, &mut rec.target, &mut rec.upper_bound] {
        if let Some(value) = bounds.get(kind) {
            if value > max {
                bounds.set(kind, max);
                changed = true;
            }
        }
    }
    changed
}

/// Limit that preserves the container's declared request:limit ratio for a
/// new recommended request. When the container declares no limit, the
/// LimitRange default applies; without either, no limit is set.
pub fn proportional_limit(
    original_limit: Option<i64>,
    original_request: Option<i64>,
    recommended_request: i64,
    default_limit: Option<i64>,
) -> Option<i64> {
    let limit = original_limit.or(default_limit)?;
    match original_request {
        Some(request) if request > 0 => {
            if limit == request {
                Some(recommended_request)
            } else {
                Some(((limit as f64) * (recommended_request as f64) / (request as f64)).round()
                    as i64)
            }
        }
        // No declared request to derive a ratio from: keep the limit as-is.
        _ => Some(limit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::ContainerResourcePolicy;
    use crate::recommend::logic::RecommendedContainerResources;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn rec(lower: i64, target: i64, upper: i64) -> RecommendedContainerResources {
        RecommendedContainerResources {
            lower_bound: Resources::new(Some(lower), None),
            target: Resources::new(Some(target), None),
            upper_bound: Resources::new(Some(upper), None),
            uncapped_target: Resources::new(Some(target), None),
        }
    }

    fn cpu_policy(min: &str, max: &str) -> ResourcePolicy {
        ResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: "app".into(),
                mode: None,
                min_allowed: BTreeMap::from([("cpu".to_string(), Quantity(min.into()))]),
                max_allowed: BTreeMap::from([("cpu".to_string(), Quantity(max.into()))]),
            }],
        }
    }

    #[test]
    fn clamps_into_policy_range() {
        // Raw target 50m with policy min 100m: everything below is raised.
        let raw = RecommendedResources::from([("app".to_string(), rec(10, 50, 2000))]);
        let policy = cpu_policy("100m", "1");

        let capped = apply(&raw, Some(&policy), None, None);
        let app = &capped.containers["app"];
        assert_eq!(app.target.cpu_milli, Some(100));
        assert_eq!(app.lower_bound.cpu_milli, Some(100));
        // Upper already inside [100, 1000]? No: raw upper 2000 > max 1000.
        assert_eq!(app.upper_bound.cpu_milli, Some(1000));
        // Uncapped target reports the raw value.
        assert_eq!(app.uncapped_target.cpu_milli, Some(50));
        let notes = &capped.annotations["app"];
        assert!(notes.iter().any(|a| a.contains("minAllowed")));
        assert!(notes.iter().any(|a| a.contains("maxAllowed")));
    }

    #[test]
    fn capping_is_idempotent() {
        let raw = RecommendedResources::from([("app".to_string(), rec(10, 50, 2000))]);
        let policy = cpu_policy("100m", "1");

        let once = apply(&raw, Some(&policy), None, None);
        let twice = apply(&once.containers, Some(&policy), None, None);
        assert_eq!(once.containers, twice.containers);
    }

    #[test]
    fn capped_bounds_stay_ordered() {
        // Policy window entirely below the raw recommendation: after
        // clamping, lower ≤ target ≤ upper still holds.
        let raw = RecommendedResources::from([("app".to_string(), rec(500, 800, 900))]);
        let policy = cpu_policy("100m", "200m");

        let capped = apply(&raw, Some(&policy), None, None);
        let app = &capped.containers["app"];
        let (l, t, u) = (
            app.lower_bound.cpu_milli.unwrap(),
            app.target.cpu_milli.unwrap(),
            app.upper_bound.cpu_milli.unwrap(),
        );
        assert!(l <= t && t <= u, "bounds out of order: {l} {t} {u}");
        assert_eq!(t, 200);
    }

    #[test]
    fn off_mode_containers_are_dropped() {
        let raw = RecommendedResources::from([
            ("app".to_string(), rec(100, 200, 300)),
            ("sidecar".to_string(), rec(10, 20, 30)),
        ]);
        let policy = ResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: "sidecar".into(),
                mode: Some(ContainerScalingMode::Off),
                ..Default::default()
            }],
        };

        let capped = apply(&raw, Some(&policy), None, None);
        assert!(capped.containers.contains_key("app"));
        assert!(!capped.containers.contains_key("sidecar"));
    }

    #[test]
    fn container_limit_range_further_clamps() {
        let raw = RecommendedResources::from([("app".to_string(), rec(100, 1500, 4000))]);
        let mut range = EffectiveLimitRange::default();
        range.max.set(ResourceKind::Cpu, 1000);

        let capped = apply(&raw, None, Some(&range), None);
        assert_eq!(capped.containers["app"].target.cpu_milli, Some(1000));
        assert!(capped.annotations["app"]
            .iter()
            .any(|a| a.contains("limit range max")));
    }

    #[test]
    fn pod_limit_range_scales_all_containers_by_common_factor() {
        let raw = RecommendedResources::from([
            ("a".to_string(), rec(100, 600, 900)),
            ("b".to_string(), rec(100, 600, 900)),
        ]);
        let mut range = EffectiveLimitRange::default();
        range.max.set(ResourceKind::Cpu, 600);

        let capped = apply(&raw, None, None, Some(&range));
        // 1200m total scaled into 600m: both halved.
        assert_eq!(capped.containers["a"].target.cpu_milli, Some(300));
        assert_eq!(capped.containers["b"].target.cpu_milli, Some(300));
        let total: i64 = capped
            .containers
            .values()
            .map(|c| c.target.cpu_milli.unwrap())
            .sum();
        assert!(total <= 600);
    }

    #[test]
    fn no_policy_passes_through_unchanged() {
        let raw = RecommendedResources::from([("app".to_string(), rec(100, 200, 300))]);
        let capped = apply(&raw, None, None, None);
        assert_eq!(capped.containers, raw);
        assert!(capped.annotations.is_empty());
    }

    #[test]
    fn proportional_limits_preserve_declared_ratio() {
        // limit 400m over request 200m: ratio 2 survives the new request.
        assert_eq!(
            proportional_limit(Some(400), Some(200), 300, None),
            Some(600)
        );
        // limit == request means limit follows the request exactly.
        assert_eq!(
            proportional_limit(Some(200), Some(200), 300, None),
            Some(300)
        );
        // No declared limit and no default: nothing to set.
        assert_eq!(proportional_limit(None, Some(200), 300, None), None);
        // No declared limit but a LimitRange default: default applies.
        assert_eq!(
            proportional_limit(None, Some(200), 300, Some(500)),
            Some(500)
        );
        // No request to derive a ratio from: the declared limit is kept.
        assert_eq!(proportional_limit(Some(400), None, 300, None), Some(400));
    }
}
