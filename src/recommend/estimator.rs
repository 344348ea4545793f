//! Resource estimators
//!
//! An estimator maps an aggregated container state to one estimated amount
//! per resource. The recommender composes a percentile estimator with
//! confidence multipliers: the lower bound collapses toward zero when the
//! observation history is short, the upper bound starts loose and converges
//! toward the target as history accumulates.

use crate::model::{AggregateContainerState, Resources};

/// Upper clamp on any estimated amount, so confidence inflation with an
/// empty history cannot overflow the integer representation
const MAX_ESTIMATED_AMOUNT: f64 = 1e15;

/// Maps an aggregate to an estimated amount per resource
pub trait ResourceEstimator {
    /// Estimated amounts; a resource with no samples is left unset
    fn estimate(&self, aggregate: &AggregateContainerState) -> Resources;
}

/// Reads fixed percentiles out of the usage histograms
#[derive(Clone, Copy, Debug)]
pub struct PercentileEstimator {
    /// Percentile of the CPU usage distribution
    pub cpu_percentile: f64,
    /// Percentile of the memory peak distribution
    pub memory_percentile: f64,
}

impl ResourceEstimator for PercentileEstimator {
    fn estimate(&self, aggregate: &AggregateContainerState) -> Resources {
        Resources {
            cpu_milli: aggregate.cpu_percentile(self.cpu_percentile),
            memory_bytes: aggregate.memory_percentile(self.memory_percentile),
        }
    }
}

/// Scales a base estimator by `(1 + multiplier/confidence)^exponent`, where
/// confidence grows with the days of observation backing the aggregate.
///
/// With a negative exponent the factor vanishes for fresh aggregates and
/// approaches 1 as history accumulates; with a positive exponent it starts
/// unbounded and converges toward 1.
pub struct ConfidenceMultiplier<E> {
    /// Numerator added per unit of confidence
    pub multiplier: f64,
    /// Exponent applied to the whole factor
    pub exponent: f64,
    /// The estimator whose output is scaled
    pub base: E,
}

/// Days of observation backing an aggregate, counting both the sample time
/// span and the sample count (normalised to one sample per minute), so a
/// burst of samples in one minute does not fake a long history.
pub fn confidence(aggregate: &AggregateContainerState) -> f64 {
    let lifespan_days = aggregate.observation_days();
    let samples_days = aggregate.total_samples_count as f64 / (60.0 * 24.0);
    lifespan_days.min(samples_days)
}

impl<E: ResourceEstimator> ResourceEstimator for ConfidenceMultiplier<E> {
    fn estimate(&self, aggregate: &AggregateContainerState) -> Resources {
        let confidence = confidence(aggregate);
        // confidence == 0 drives the factor to 0 (negative exponent) or to
        // the MAX_ESTIMATED_AMOUNT clamp (positive exponent).
        let factor = (1.0 + self.multiplier / confidence).powf(self.exponent);
        let mut out = Resources::default();
        for (kind, value) in self.base.estimate(aggregate).iter() {
            let scaled = (value as f64 * factor).min(MAX_ESTIMATED_AMOUNT);
            out.set(kind, scaled.ceil() as i64);
        }
        out
    }
}
