//! Bucketed weight histograms
//!
//! The histogram is the statistical kernel of the recommender: container
//! usage samples are folded into per-bucket weights, and recommendations
//! read percentiles back out. The bucket layout is fixed at construction
//! and deterministic, so serialised histograms survive process restarts.

use std::sync::Arc;

use crate::crd::HistogramCheckpoint;
use crate::error::Error;

/// Largest bucket weight stored in a checkpoint; all weights are scaled so
/// the heaviest bucket lands exactly here.
pub const MAX_CHECKPOINT_WEIGHT: u32 = 10_000;

/// Bucket layout shared by all histograms of one resource kind
#[derive(Debug, Clone)]
pub struct HistogramOptions {
    /// Start boundary of each bucket; bucket `i` covers
    /// `[bounds[i], bounds[i+1])`, the last bucket is unbounded above
    bounds: Vec<f64>,
    /// Weights below this are treated as zero
    epsilon: f64,
}

impl HistogramOptions {
    /// Evenly sized buckets covering `[0, max_value]`
    pub fn linear(max_value: f64, bucket_size: f64, epsilon: f64) -> Result<Self, Error> {
        if max_value <= 0.0 || bucket_size <= 0.0 || epsilon <= 0.0 {
            return Err(Error::validation(
                "linear histogram needs positive max value, bucket size and epsilon",
            ));
        }
        let mut bounds = Vec::new();
        let mut start = 0.0;
        while start < max_value {
            bounds.push(start);
            start += bucket_size;
        }
        Ok(Self { bounds, epsilon })
    }

    /// Geometrically growing buckets: the first bucket is
    /// `first_bucket_size` wide and each subsequent bucket is `ratio`
    /// times wider, until `max_value` is covered
    pub fn exponential(
        max_value: f64,
        first_bucket_size: f64,
        ratio: f64,
        epsilon: f64,
    ) -> Result<Self, Error> {
        if max_value <= 0.0 || first_bucket_size <= 0.0 || ratio <= 1.0 || epsilon <= 0.0 {
            return Err(Error::validation(
                "exponential histogram needs positive sizes and ratio > 1",
            ));
        }
        let mut bounds = Vec::new();
        let mut start = 0.0;
        let mut width = first_bucket_size;
        while start < max_value {
            bounds.push(start);
            start += width;
            width *= ratio;
        }
        Ok(Self { bounds, epsilon })
    }

    /// Number of buckets in the layout
    pub fn num_buckets(&self) -> usize {
        self.bounds.len()
    }

    /// Index of the bucket containing `value`
    pub fn find_bucket(&self, value: f64) -> usize {
        let idx = self.bounds.partition_point(|b| *b <= value);
        idx.saturating_sub(1)
    }

    /// Start boundary of bucket `bucket`
    pub fn bucket_start(&self, bucket: usize) -> f64 {
        self.bounds[bucket]
    }

    /// Weight cutoff below which a bucket counts as empty
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

/// An empirical weight distribution over a fixed bucket layout
#[derive(Debug, Clone)]
pub struct Histogram {
    options: Arc<HistogramOptions>,
    weights: Vec<f64>,
    total_weight: f64,
    // Smallest and largest buckets with non-zero weight; min > max when empty.
    min_bucket: usize,
    max_bucket: usize,
}

impl Histogram {
    /// Create an empty histogram over the given layout
    pub fn new(options: Arc<HistogramOptions>) -> Self {
        let n = options.num_buckets();
        Self {
            weights: vec![0.0; n],
            total_weight: 0.0,
            min_bucket: n - 1,
            max_bucket: 0,
            options,
        }
    }

    /// The bucket layout this histogram was built over
    pub fn options(&self) -> &Arc<HistogramOptions> {
        &self.options
    }

    /// True when no observable weight is stored
    pub fn is_empty(&self) -> bool {
        self.total_weight < self.options.epsilon || self.min_bucket > self.max_bucket
    }

    /// Total stored weight
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Add `weight` at `value`
    pub fn add_sample(&mut self, value: f64, weight: f64) {
        if weight < 0.0 {
            return;
        }
        let bucket = self.options.find_bucket(value);
        self.weights[bucket] += weight;
        self.total_weight += weight;
        if self.min_bucket > self.max_bucket {
            self.min_bucket = bucket;
            self.max_bucket = bucket;
        } else {
            self.min_bucket = self.min_bucket.min(bucket);
            self.max_bucket = self.max_bucket.max(bucket);
        }
    }

    /// Remove up to `weight` from the bucket containing `value`
    pub fn subtract_sample(&mut self, value: f64, weight: f64) {
        if weight < 0.0 {
            return;
        }
        let bucket = self.options.find_bucket(value);
        let removed = weight.min(self.weights[bucket]);
        self.weights[bucket] -= removed;
        self.total_weight -= removed;
        if self.weights[bucket] < self.options.epsilon {
            self.total_weight -= self.weights[bucket];
            self.weights[bucket] = 0.0;
            self.refresh_bucket_range();
        }
    }

    /// Add the other histogram's weights elementwise; the layouts must match
    pub fn merge(&mut self, other: &Histogram) {
        debug_assert_eq!(self.options.num_buckets(), other.options.num_buckets());
        for (bucket, weight) in other.weights.iter().enumerate() {
            if *weight > 0.0 {
                self.weights[bucket] += weight;
                self.total_weight += weight;
                if self.min_bucket > self.max_bucket {
                    self.min_bucket = bucket;
                    self.max_bucket = bucket;
                } else {
                    self.min_bucket = self.min_bucket.min(bucket);
                    self.max_bucket = self.max_bucket.max(bucket);
                }
            }
        }
    }

    /// Multiply every weight by `factor ≥ 0`
    pub fn scale(&mut self, factor: f64) {
        if factor < 0.0 {
            return;
        }
        for weight in &mut self.weights {
            *weight *= factor;
        }
        self.total_weight *= factor;
        self.refresh_bucket_range();
    }

    /// Smallest bucket upper bound whose cumulative weight reaches
    /// `percentile · total`; 0 for an empty histogram
    pub fn percentile(&self, percentile: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let threshold = percentile * self.total_weight;
        let mut partial = 0.0;
        let mut bucket = self.min_bucket;
        while bucket < self.max_bucket {
            partial += self.weights[bucket];
            if partial >= threshold {
                break;
            }
            bucket += 1;
        }
        if bucket < self.options.num_buckets() - 1 {
            // End of the bucket.
            self.options.bucket_start(bucket + 1)
        } else {
            // The last bucket has no upper bound; its start is the best answer.
            self.options.bucket_start(bucket)
        }
    }

    /// Serialise into the compressed checkpoint form: weights normalised so
    /// the heaviest bucket stores [`MAX_CHECKPOINT_WEIGHT`]. Non-empty
    /// buckets are rounded up so they survive the round trip.
    pub fn save_checkpoint(&self) -> HistogramCheckpoint {
        let mut checkpoint = HistogramCheckpoint {
            total_weight: self.total_weight,
            ..Default::default()
        };
        if self.is_empty() {
            return checkpoint;
        }
        let heaviest = self.weights[self.min_bucket..=self.max_bucket]
            .iter()
            .cloned()
            .fold(0.0_f64, f64::max);
        if heaviest <= 0.0 {
            return checkpoint;
        }
        let ratio = f64::from(MAX_CHECKPOINT_WEIGHT) / heaviest;
        for bucket in self.min_bucket..=self.max_bucket {
            let weight = self.weights[bucket];
            if weight > self.options.epsilon {
                checkpoint
                    .bucket_weights
                    .insert(bucket, (weight * ratio).ceil() as u32);
            }
        }
        checkpoint
    }

    /// Restore from the checkpoint form, replacing current contents
    pub fn load_checkpoint(&mut self, checkpoint: &HistogramCheckpoint) -> Result<(), Error> {
        if checkpoint.total_weight < 0.0 {
            return Err(Error::checkpoint(format!(
                "negative total weight {}",
                checkpoint.total_weight
            )));
        }
        let n = self.options.num_buckets();
        let mut sum = 0.0;
        for (bucket, weight) in &checkpoint.bucket_weights {
            if *bucket >= n {
                return Err(Error::checkpoint(format!(
                    "bucket index {bucket} out of range (histogram has {n} buckets)"
                )));
            }
            sum += f64::from(*weight);
        }
        self.weights.iter_mut().for_each(|w| *w = 0.0);
        self.total_weight = 0.0;
        self.min_bucket = n - 1;
        self.max_bucket = 0;
        if sum <= 0.0 {
            return Ok(());
        }
        // Restore relative weights, then rescale to the exact recorded total.
        let ratio = checkpoint.total_weight / sum;
        for (bucket, weight) in &checkpoint.bucket_weights {
            let restored = f64::from(*weight) * ratio;
            self.weights[*bucket] = restored;
            self.total_weight += restored;
            self.min_bucket = self.min_bucket.min(*bucket);
            self.max_bucket = self.max_bucket.max(*bucket);
        }
        Ok(())
    }

    fn refresh_bucket_range(&mut self) {
        let epsilon = self.options.epsilon;
        let first = self.weights.iter().position(|w| *w >= epsilon);
        match first {
            Some(min) => {
                self.min_bucket = min;
                self.max_bucket = self
                    .weights
                    .iter()
                    .rposition(|w| *w >= epsilon)
                    .unwrap_or(min);
            }
            None => {
                self.min_bucket = self.options.num_buckets() - 1;
                self.max_bucket = 0;
            }
        }
    }
}

/// Default CPU bucket layout: 0.01-core first bucket growing 5% per bucket
/// up to 1000 cores
pub fn cpu_histogram_options() -> HistogramOptions {
    HistogramOptions::exponential(1000.0, 0.01, 1.05, 1e-4)
        .unwrap_or_else(|_| unreachable!("static cpu layout is valid"))
}

/// Default memory bucket layout: 10 MB first bucket growing 5% per bucket
/// up to 1 TB
pub fn memory_histogram_options() -> HistogramOptions {
    HistogramOptions::exponential(1e12, 1e7, 1.05, 1e-4)
        .unwrap_or_else(|_| unreachable!("static memory layout is valid"))
}
