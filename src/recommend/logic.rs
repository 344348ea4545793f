//! Recommendation assembly
//!
//! Maps the merged per-container aggregates of one autoscaler to raw
//! `(lowerBound, target, upperBound)` recommendations, before any policy
//! capping.

use std::collections::BTreeMap;

use crate::crd::types::Recommendation;
use crate::model::{AggregateContainerState, Resources};

use super::estimator::{ConfidenceMultiplier, PercentileEstimator, ResourceEstimator};

/// Default percentile backing the target recommendation
pub const TARGET_PERCENTILE: f64 = 0.90;

/// Raw recommendation for a single container
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecommendedContainerResources {
    /// Request below which the pod should be updated
    pub lower_bound: Resources,
    /// Recommended request
    pub target: Resources,
    /// Request above which the pod should be updated
    pub upper_bound: Resources,
    /// Target before capping; the capping pipeline preserves this
    pub uncapped_target: Resources,
}

/// Recommendations per container name
pub type RecommendedResources = BTreeMap<String, RecommendedContainerResources>;

/// Parse a status recommendation back into the internal form; unparseable
/// quantities are treated as absent
pub fn from_api_recommendation(recommendation: &Recommendation) -> RecommendedResources {
    let mut out = RecommendedResources::new();
    for rec in &recommendation.container_recommendations {
        out.insert(
            rec.container_name.clone(),
            RecommendedContainerResources {
                lower_bound: Resources::from_quantity_map(&rec.lower_bound).unwrap_or_default(),
                target: Resources::from_quantity_map(&rec.target).unwrap_or_default(),
                upper_bound: Resources::from_quantity_map(&rec.upper_bound).unwrap_or_default(),
                uncapped_target: Resources::from_quantity_map(&rec.uncapped_target)
                    .unwrap_or_default(),
            },
        );
    }
    out
}

/// Computes per-container recommendations from aggregated usage
pub struct PodResourceRecommender {
    target: PercentileEstimator,
    lower: ConfidenceMultiplier<PercentileEstimator>,
    upper: ConfidenceMultiplier<PercentileEstimator>,
}

impl Default for PodResourceRecommender {
    fn default() -> Self {
        let percentiles = PercentileEstimator {
            cpu_percentile: TARGET_PERCENTILE,
            memory_percentile: TARGET_PERCENTILE,
        };
        Self {
            target: percentiles,
            // Short histories yield a near-zero lower bound and a huge upper
            // bound; both converge toward the target as days accumulate.
            lower: ConfidenceMultiplier {
                multiplier: 1.0,
                exponent: -2.0,
                base: percentiles,
            },
            upper: ConfidenceMultiplier {
                multiplier: 1.0,
                exponent: 1.0,
                base: percentiles,
            },
        }
    }
}

impl PodResourceRecommender {
    /// Compute raw recommendations for every container with usage history.
    /// Containers whose aggregate is empty are omitted entirely; a container
    /// absent from the running pod set but with samples still gets one.
    pub fn recommend(
        &self,
        aggregates: &BTreeMap<String, AggregateContainerState>,
    ) -> RecommendedResources {
        let mut out = RecommendedResources::new();
        for (container_name, aggregate) in aggregates {
            if aggregate.is_empty() {
                continue;
            }
            let target = self.target.estimate(aggregate);
            if target.is_empty() {
                continue;
            }
            out.insert(
                container_name.clone(),
                RecommendedContainerResources {
                    lower_bound: self.lower.estimate(aggregate),
                    target,
                    upper_bound: self.upper.estimate(aggregate),
                    uncapped_target: target,
                },
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::aggregation::AggregationOptions;
    use crate::model::{ContainerUsageSample, ResourceKind};
    use chrono::{DateTime, TimeZone, Utc};

    const MI: i64 = 1 << 20;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    fn cpu(agg: &mut AggregateContainerState, secs: i64, milli: i64) {
        agg.add_sample(&ContainerUsageSample {
            measure_start: t(secs),
            usage: milli,
            request: 500,
            resource: ResourceKind::Cpu,
        });
    }

    fn mem(agg: &mut AggregateContainerState, secs: i64, bytes: i64) {
        agg.add_sample(&ContainerUsageSample {
            measure_start: t(secs),
            usage: bytes,
            request: 0,
            resource: ResourceKind::Memory,
        });
    }

    #[test]
    fn cold_start_recommendation_matches_expectations() {
        // Two CPU samples (0.2, 0.4 cores) and one memory sample (100Mi)
        // with essentially no history.
        let mut agg = AggregateContainerState::new(&AggregationOptions::default());
        cpu(&mut agg, 0, 200);
        cpu(&mut agg, 1, 400);
        mem(&mut agg, 0, 100 * MI);

        let rec = PodResourceRecommender::default()
            .recommend(&BTreeMap::from([("app".to_string(), agg)]));
        let app = &rec["app"];

        let target_cpu = app.target.cpu_milli.unwrap();
        assert!(
            (380..=460).contains(&target_cpu),
            "target cpu {target_cpu}m, expected about 400m"
        );
        let target_mem = app.target.memory_bytes.unwrap();
        assert!((target_mem - 100 * MI).abs() < 10 * MI);

        // Low confidence: loose bounds on both sides.
        assert!(app.lower_bound.cpu_milli.unwrap() < target_cpu / 10);
        assert!(app.upper_bound.cpu_milli.unwrap() > target_cpu * 10);
        assert_eq!(app.uncapped_target, app.target);
    }

    #[test]
    fn empty_aggregate_produces_no_recommendation() {
        let empty = AggregateContainerState::new(&AggregationOptions::default());
        let rec = PodResourceRecommender::default()
            .recommend(&BTreeMap::from([("idle".to_string(), empty)]));
        assert!(rec.is_empty());
    }

    #[test]
    fn memory_only_container_gets_memory_only_recommendation() {
        let mut agg = AggregateContainerState::new(&AggregationOptions::default());
        mem(&mut agg, 0, 200 * MI);

        let rec = PodResourceRecommender::default()
            .recommend(&BTreeMap::from([("app".to_string(), agg)]));
        let app = &rec["app"];
        assert!(app.target.cpu_milli.is_none());
        assert!(app.target.memory_bytes.is_some());
    }

    #[test]
    fn containers_are_ordered_deterministically() {
        let mut a = AggregateContainerState::new(&AggregationOptions::default());
        let mut b = AggregateContainerState::new(&AggregationOptions::default());
        cpu(&mut a, 0, 100);
        cpu(&mut b, 0, 100);

        let rec = PodResourceRecommender::default().recommend(&BTreeMap::from([
            ("zeta".to_string(), a),
            ("alpha".to_string(), b),
        ]));
        let names: Vec<&String> = rec.keys().collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }
}
