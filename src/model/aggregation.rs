//! Aggregated per-container usage state
//!
//! An [`AggregateContainerState`] is the statistical history of one logical
//! container across pod recreations: one decaying histogram of CPU usage,
//! one of memory peaks, and the bookkeeping needed to judge how much
//! history backs a recommendation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::crd::{AutoscalerCheckpointStatus, CHECKPOINT_VERSION};
use crate::error::Error;

use super::decaying_histogram::DecayingHistogram;
use super::histogram::{cpu_histogram_options, memory_histogram_options, Histogram, HistogramOptions};
use super::resources::{cores_from_milli, milli_from_cores, ResourceKind};

/// Decay half-life for both usage histograms
pub fn histogram_decay_half_life() -> Duration {
    Duration::hours(24)
}

/// Length of one memory peak aggregation window
pub fn memory_aggregation_interval() -> Duration {
    Duration::hours(24)
}

/// How long an aggregate may go without samples before it is collectable
pub fn aggregate_retention() -> Duration {
    Duration::days(8)
}

/// Smallest weight a CPU sample can carry, so idle containers still
/// contribute history
pub const MIN_SAMPLE_WEIGHT: f64 = 0.1;

/// Multiplier applied to the last observed memory usage when a container
/// OOMs, so the next recommendation clears the observed ceiling
pub const OOM_BUMP_UP_RATIO: f64 = 1.2;

/// One usage measurement for a single container
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContainerUsageSample {
    /// Start of the measurement window
    pub measure_start: DateTime<Utc>,
    /// Measured usage: millicores for CPU, bytes for memory
    pub usage: i64,
    /// The container's declared request at measurement time (same unit)
    pub request: i64,
    /// Which resource was measured
    pub resource: ResourceKind,
}

/// Shared bucket layouts, built once per process and handed to every
/// aggregate so checkpoints stay mutually compatible
#[derive(Debug, Clone)]
pub struct AggregationOptions {
    cpu_options: Arc<HistogramOptions>,
    memory_options: Arc<HistogramOptions>,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            cpu_options: Arc::new(cpu_histogram_options()),
            memory_options: Arc::new(memory_histogram_options()),
        }
    }
}

/// Statistical history of one logical container
#[derive(Debug, Clone)]
pub struct AggregateContainerState {
    /// Distribution of CPU usage, weighted by request
    cpu_usage: DecayingHistogram,
    /// Distribution of per-window memory peaks
    memory_peaks: DecayingHistogram,
    /// Peak observed within the current memory window, in bytes
    window_peak: i64,
    /// End of the current memory window
    window_end: Option<DateTime<Utc>>,
    /// Time of the first sample ever folded in
    pub first_sample_start: Option<DateTime<Utc>>,
    /// Time of the most recent sample
    pub last_sample_start: Option<DateTime<Utc>>,
    /// Total number of CPU samples folded in
    pub total_samples_count: u64,
}

impl AggregateContainerState {
    /// Create an empty aggregate over the shared bucket layouts
    pub fn new(options: &AggregationOptions) -> Self {
        Self {
            cpu_usage: DecayingHistogram::new(
                Histogram::new(options.cpu_options.clone()),
                histogram_decay_half_life(),
            ),
            memory_peaks: DecayingHistogram::new(
                Histogram::new(options.memory_options.clone()),
                histogram_decay_half_life(),
            ),
            window_peak: 0,
            window_end: None,
            first_sample_start: None,
            last_sample_start: None,
            total_samples_count: 0,
        }
    }

    /// True when neither histogram holds any weight
    pub fn is_empty(&self) -> bool {
        self.cpu_usage.is_empty() && self.memory_peaks.is_empty()
    }

    /// True when the aggregate saw no sample within the retention period
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.last_sample_start {
            Some(last) => now - last > aggregate_retention(),
            None => true,
        }
    }

    /// Days of observation backing this aggregate
    pub fn observation_days(&self) -> f64 {
        match (self.first_sample_start, self.last_sample_start) {
            (Some(first), Some(last)) if last > first => {
                (last - first).num_seconds() as f64 / 86_400.0
            }
            _ => 0.0,
        }
    }

    /// Percentile of the CPU usage distribution, in millicores
    pub fn cpu_percentile(&self, percentile: f64) -> Option<i64> {
        if self.cpu_usage.is_empty() {
            return None;
        }
        Some(milli_from_cores(self.cpu_usage.percentile(percentile)))
    }

    /// Percentile of the memory peak distribution, in bytes
    pub fn memory_percentile(&self, percentile: f64) -> Option<i64> {
        if self.memory_peaks.is_empty() {
            return None;
        }
        Some(self.memory_peaks.percentile(percentile).ceil() as i64)
    }

    /// Fold one usage sample into the aggregate
    pub fn add_sample(&mut self, sample: &ContainerUsageSample) {
        match sample.resource {
            ResourceKind::Cpu => self.add_cpu_sample(sample),
            ResourceKind::Memory => self.add_memory_sample(sample.measure_start, sample.usage),
        }
    }

    /// Record an OOM kill: synthesise a memory sample above the last
    /// observed usage so the recommendation clears the ceiling immediately
    pub fn record_oom(&mut self, time: DateTime<Utc>, last_memory_bytes: i64) {
        let bumped = (last_memory_bytes as f64 * OOM_BUMP_UP_RATIO) as i64;
        self.add_memory_sample(time, bumped);
    }

    /// Merge the other aggregate's histograms and bookkeeping into this one
    pub fn merge(&mut self, other: &AggregateContainerState) {
        self.cpu_usage.merge(&other.cpu_usage);
        self.memory_peaks.merge(&other.memory_peaks);
        self.total_samples_count += other.total_samples_count;
        self.first_sample_start = match (self.first_sample_start, other.first_sample_start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_sample_start = match (self.last_sample_start, other.last_sample_start) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    fn add_cpu_sample(&mut self, sample: &ContainerUsageSample) {
        // Weight by the declared request so a starved high-request container
        // is not outvoted by many idle low-request peers.
        let weight = cores_from_milli(sample.request).max(MIN_SAMPLE_WEIGHT);
        self.cpu_usage.add_sample(
            cores_from_milli(sample.usage),
            weight,
            sample.measure_start,
        );
        self.total_samples_count += 1;
        self.first_sample_start = Some(
            self.first_sample_start
                .map_or(sample.measure_start, |f| f.min(sample.measure_start)),
        );
        self.last_sample_start = Some(
            self.last_sample_start
                .map_or(sample.measure_start, |l| l.max(sample.measure_start)),
        );
    }

    /// Memory is aggregated as a windowed peak: within a window a higher
    /// observation replaces the recorded peak (subtract + re-add); a sample
    /// past the window end rolls the window over and starts a new peak.
    fn add_memory_sample(&mut self, time: DateTime<Utc>, usage_bytes: i64) {
        let window_end = match self.window_end {
            Some(end) if time < end => end,
            Some(end) => {
                // Roll the window forward to the interval containing `time`.
                let interval = memory_aggregation_interval().num_seconds();
                let elapsed = (time - end).num_seconds();
                let shift = (elapsed / interval + 1) * interval;
                let new_end = end + Duration::seconds(shift);
                self.window_end = Some(new_end);
                self.window_peak = 0;
                new_end
            }
            None => {
                let new_end = time + memory_aggregation_interval();
                self.window_end = Some(new_end);
                self.window_peak = 0;
                new_end
            }
        };

        if usage_bytes > self.window_peak {
            if self.window_peak > 0 {
                self.memory_peaks
                    .subtract_sample(self.window_peak as f64, 1.0, window_end);
            }
            self.memory_peaks
                .add_sample(usage_bytes as f64, 1.0, window_end);
            self.window_peak = usage_bytes;
        }
        self.first_sample_start = Some(self.first_sample_start.map_or(time, |f| f.min(time)));
        self.last_sample_start = Some(self.last_sample_start.map_or(time, |l| l.max(time)));
    }

    /// Serialise into a checkpoint status payload
    pub fn save_checkpoint(&self) -> AutoscalerCheckpointStatus {
        AutoscalerCheckpointStatus {
            first_sample_start: self.first_sample_start,
            last_sample_start: self.last_sample_start,
            total_samples_count: self.total_samples_count,
            cpu_histogram: Some(self.cpu_usage.save_checkpoint()),
            memory_histogram: Some(self.memory_peaks.save_checkpoint()),
            version: Some(CHECKPOINT_VERSION.to_string()),
            last_update_time: None,
        }
    }

    /// Restore from a checkpoint status payload
    pub fn load_checkpoint(&mut self, status: &AutoscalerCheckpointStatus) -> Result<(), Error> {
        match status.version.as_deref() {
            Some(CHECKPOINT_VERSION) => {}
            other => {
                return Err(Error::checkpoint(format!(
                    "unsupported checkpoint version {:?}, expected {}",
                    other, CHECKPOINT_VERSION
                )))
            }
        }
        if let Some(cpu) = &status.cpu_histogram {
            self.cpu_usage.load_checkpoint(cpu)?;
        }
        if let Some(memory) = &status.memory_histogram {
            self.memory_peaks.load_checkpoint(memory)?;
        }
        self.first_sample_start = status.first_sample_start;
        self.last_sample_start = status.last_sample_start;
        self.total_samples_count = status.total_samples_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MI: i64 = 1 << 20;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    fn cpu_sample(secs: i64, milli: i64, request: i64) -> ContainerUsageSample {
        ContainerUsageSample {
            measure_start: t(secs),
            usage: milli,
            request,
            resource: ResourceKind::Cpu,
        }
    }

    fn memory_sample(secs: i64, bytes: i64) -> ContainerUsageSample {
        ContainerUsageSample {
            measure_start: t(secs),
            usage: bytes,
            request: 0,
            resource: ResourceKind::Memory,
        }
    }

    #[test]
    fn empty_aggregate_yields_no_percentiles() {
        let agg = AggregateContainerState::new(&AggregationOptions::default());
        assert!(agg.is_empty());
        assert_eq!(agg.cpu_percentile(0.9), None);
        assert_eq!(agg.memory_percentile(0.9), None);
        assert_eq!(agg.observation_days(), 0.0);
    }

    #[test]
    fn cold_start_two_cpu_samples() {
        // Two equally-weighted samples at 0.2 and 0.4 cores: the 90th
        // percentile lands in the 0.4-core bucket.
        let mut agg = AggregateContainerState::new(&AggregationOptions::default());
        agg.add_sample(&cpu_sample(0, 200, 500));
        agg.add_sample(&cpu_sample(1, 400, 500));
        agg.add_sample(&memory_sample(0, 100 * MI));

        let target_cpu = agg.cpu_percentile(0.9).unwrap();
        assert!(
            (380..=460).contains(&target_cpu),
            "p90 cpu was {target_cpu}m, expected about 400m"
        );
        let target_mem = agg.memory_percentile(0.9).unwrap();
        let expected = 100 * MI;
        assert!(
            (target_mem - expected).abs() < expected / 10,
            "p90 memory was {target_mem}, expected about {expected}"
        );
        assert_eq!(agg.total_samples_count, 2);
        assert!(agg.observation_days() < 1e-3);
    }

    #[test]
    fn cpu_weighting_favors_high_request_containers() {
        let mut agg = AggregateContainerState::new(&AggregationOptions::default());
        // Low-request container busy at 100m, high-request container at 900m.
        for i in 0..10 {
            agg.add_sample(&cpu_sample(i, 100, 100));
        }
        agg.add_sample(&cpu_sample(100, 900, 4000));

        // The single high-request sample carries 4 cores of weight against
        // 10 × 0.1, so the median already sits near 900m.
        let p50 = agg.cpu_percentile(0.5).unwrap();
        assert!(p50 >= 850, "p50 was {p50}m");
    }

    #[test]
    fn memory_peak_replaces_lower_peak_within_window() {
        let mut agg = AggregateContainerState::new(&AggregationOptions::default());
        agg.add_sample(&memory_sample(0, 100 * MI));
        agg.add_sample(&memory_sample(60, 300 * MI));
        agg.add_sample(&memory_sample(120, 200 * MI));

        // One window, one peak: 300Mi. The lower follow-up must not add a
        // second sample.
        let p99 = agg.memory_percentile(0.99).unwrap();
        let p01 = agg.memory_percentile(0.01).unwrap();
        assert!((p99 - 300 * MI).abs() < 30 * MI, "p99 was {p99}");
        assert!((p01 - 300 * MI).abs() < 30 * MI, "p01 was {p01}");
    }

    #[test]
    fn memory_window_rollover_starts_new_peak() {
        let mut agg = AggregateContainerState::new(&AggregationOptions::default());
        let day = memory_aggregation_interval().num_seconds();
        agg.add_sample(&memory_sample(0, 400 * MI));
        agg.add_sample(&memory_sample(day + 60, 100 * MI));

        // Two windows, two peaks; the low percentile now sees the small one.
        let p01 = agg.memory_percentile(0.01).unwrap();
        assert!((p01 - 100 * MI).abs() < 10 * MI, "p01 was {p01}");
        let p99 = agg.memory_percentile(0.99).unwrap();
        assert!((p99 - 400 * MI).abs() < 40 * MI, "p99 was {p99}");
    }

    #[test]
    fn oom_bumps_memory_recommendation() {
        let mut agg = AggregateContainerState::new(&AggregationOptions::default());
        agg.add_sample(&memory_sample(0, 200 * MI));
        agg.record_oom(t(1), 200 * MI);

        // The synthesised sample at 240Mi replaces the 200Mi window peak.
        let p99 = agg.memory_percentile(0.99).unwrap();
        assert!(p99 >= 240 * MI, "p99 was {p99}, expected at least 240Mi");
    }

    #[test]
    fn expiry_follows_last_sample() {
        let mut agg = AggregateContainerState::new(&AggregationOptions::default());
        assert!(agg.is_expired(t(0)));
        agg.add_sample(&cpu_sample(0, 100, 100));
        assert!(!agg.is_expired(t(3600)));
        assert!(agg.is_expired(t(9 * 86_400)));
    }

    #[test]
    fn checkpoint_round_trip_preserves_recommendation_inputs() {
        let options = AggregationOptions::default();
        let mut agg = AggregateContainerState::new(&options);
        for i in 0..20 {
            agg.add_sample(&cpu_sample(i * 60, 150 + i * 10, 500));
        }
        agg.add_sample(&memory_sample(0, 512 * MI));

        let status = agg.save_checkpoint();
        assert_eq!(status.version.as_deref(), Some(CHECKPOINT_VERSION));

        let mut restored = AggregateContainerState::new(&options);
        restored.load_checkpoint(&status).unwrap();

        assert_eq!(restored.total_samples_count, agg.total_samples_count);
        assert_eq!(restored.first_sample_start, agg.first_sample_start);
        for p in [0.5, 0.9, 0.95] {
            let a = agg.cpu_percentile(p).unwrap();
            let b = restored.cpu_percentile(p).unwrap();
            let tolerance = (a / 10).max(20);
            assert!((a - b).abs() <= tolerance, "cpu p{p} {a} vs {b}");
        }
    }

    #[test]
    fn checkpoint_version_mismatch_is_rejected() {
        let options = AggregationOptions::default();
        let agg = AggregateContainerState::new(&options);
        let mut status = agg.save_checkpoint();
        status.version = Some("v1".into());

        let mut restored = AggregateContainerState::new(&options);
        assert!(matches!(
            restored.load_checkpoint(&status),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn merge_combines_histories() {
        let options = AggregationOptions::default();
        let mut a = AggregateContainerState::new(&options);
        let mut b = AggregateContainerState::new(&options);
        a.add_sample(&cpu_sample(0, 100, 100));
        b.add_sample(&cpu_sample(86_400, 500, 100));

        a.merge(&b);
        assert_eq!(a.total_samples_count, 2);
        assert!((a.observation_days() - 1.0).abs() < 0.01);
        assert!(a.cpu_percentile(0.99).unwrap() >= 500);
    }
}
