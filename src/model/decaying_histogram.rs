//! Histograms with exponential time decay
//!
//! A decaying histogram weights each sample by `2^((t - t_ref)/halfLife)`,
//! so a sample is worth twice as much as one taken a half-life earlier.
//! Rather than rescaling every stored bucket on each insert, the reference
//! timestamp is shifted lazily (in whole half-life multiples) once the
//! inflation factor would grow past `2^MAX_DECAY_EXPONENT`, and the stored
//! weights are scaled down in one pass.

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::crd::HistogramCheckpoint;
use crate::error::Error;

use super::histogram::Histogram;

/// Largest tolerated exponent before the reference timestamp is shifted
const MAX_DECAY_EXPONENT: f64 = 100.0;

/// A [`Histogram`] whose sample weights decay exponentially with age
#[derive(Debug, Clone)]
pub struct DecayingHistogram {
    histogram: Histogram,
    half_life: Duration,
    reference_timestamp: Option<DateTime<Utc>>,
}

impl DecayingHistogram {
    /// Wrap a histogram with the given decay half-life
    pub fn new(histogram: Histogram, half_life: Duration) -> Self {
        Self {
            histogram,
            half_life,
            reference_timestamp: None,
        }
    }

    /// True when no observable weight is stored
    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Percentile of the decayed distribution; 0 when empty
    pub fn percentile(&self, percentile: f64) -> f64 {
        self.histogram.percentile(percentile)
    }

    /// Add `weight` at `value`, decayed relative to `time`
    pub fn add_sample(&mut self, value: f64, weight: f64, time: DateTime<Utc>) {
        let factor = self.decay_factor(time);
        self.histogram.add_sample(value, weight * factor);
    }

    /// Remove a previously added sample with the same timestamp
    pub fn subtract_sample(&mut self, value: f64, weight: f64, time: DateTime<Utc>) {
        let factor = self.decay_factor(time);
        self.histogram.subtract_sample(value, weight * factor);
    }

    /// Fold the other histogram into this one, aligning reference times to
    /// the later of the two
    pub fn merge(&mut self, other: &DecayingHistogram) {
        match (self.reference_timestamp, other.reference_timestamp) {
            (_, None) => {}
            (None, Some(theirs)) => {
                self.reference_timestamp = Some(theirs);
                self.histogram.merge(&other.histogram);
            }
            (Some(ours), Some(theirs)) if ours < theirs => {
                self.shift_reference_timestamp(theirs);
                self.histogram.merge(&other.histogram);
            }
            (Some(ours), Some(theirs)) if theirs < ours => {
                let mut shifted = other.clone();
                shifted.shift_reference_timestamp(ours);
                self.histogram.merge(&shifted.histogram);
            }
            _ => self.histogram.merge(&other.histogram),
        }
    }

    /// Serialise histogram weights together with the reference timestamp
    pub fn save_checkpoint(&self) -> HistogramCheckpoint {
        let mut checkpoint = self.histogram.save_checkpoint();
        checkpoint.reference_timestamp = self.reference_timestamp;
        checkpoint
    }

    /// Restore from the checkpoint form, replacing current contents
    pub fn load_checkpoint(&mut self, checkpoint: &HistogramCheckpoint) -> Result<(), Error> {
        self.histogram.load_checkpoint(checkpoint)?;
        self.reference_timestamp = checkpoint.reference_timestamp;
        Ok(())
    }

    fn half_life_seconds(&self) -> f64 {
        self.half_life.num_milliseconds() as f64 / 1000.0
    }

    fn decay_factor(&mut self, timestamp: DateTime<Utc>) -> f64 {
        let reference = match self.reference_timestamp {
            Some(reference) => reference,
            None => {
                let aligned = self.align(timestamp);
                self.reference_timestamp = Some(aligned);
                aligned
            }
        };
        let elapsed = (timestamp - reference).num_milliseconds() as f64 / 1000.0;
        let exponent = elapsed / self.half_life_seconds();
        if exponent > MAX_DECAY_EXPONENT {
            self.shift_reference_timestamp(timestamp);
            let reference = self.reference_timestamp.unwrap_or(timestamp);
            let elapsed = (timestamp - reference).num_milliseconds() as f64 / 1000.0;
            return 2.0_f64.powf(elapsed / self.half_life_seconds());
        }
        2.0_f64.powf(exponent)
    }

    /// Move the reference timestamp forward to a half-life-aligned point and
    /// scale stored weights down by the corresponding power of two
    fn shift_reference_timestamp(&mut self, new_reference: DateTime<Utc>) {
        let aligned = self.align(new_reference);
        if let Some(current) = self.reference_timestamp {
            if aligned <= current {
                return;
            }
            let periods =
                (aligned - current).num_milliseconds() as f64 / 1000.0 / self.half_life_seconds();
            self.histogram.scale(2.0_f64.powf(-periods));
        }
        self.reference_timestamp = Some(aligned);
    }

    /// Truncate a timestamp down to a whole number of half-lives since epoch
    /// so shifted references line up regardless of sample arrival order
    fn align(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let half_life_secs = self.half_life.num_seconds().max(1);
        let aligned = timestamp.timestamp().div_euclid(half_life_secs) * half_life_secs;
        Utc.timestamp_opt(aligned, 0)
            .single()
            .unwrap_or(timestamp)
    }
}
