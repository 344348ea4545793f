//! In-memory cluster model and its statistical kernel
//!
//! - [`histogram`] / [`decaying_histogram`] - bucketed distributions with
//!   exponential time decay
//! - [`aggregation`] - per-container usage aggregation across pod restarts
//! - [`cluster`] - the flat-map model of pods, configs and aggregates
//! - [`resources`] - CPU/memory amounts and quantity conversion
//! - [`selector`] - pod label selector matching

pub mod aggregation;
pub mod cluster;
pub mod decaying_histogram;
pub mod histogram;
pub mod resources;
pub mod selector;

pub use aggregation::{AggregateContainerState, AggregationOptions, ContainerUsageSample};
pub use cluster::{
    AggregateStateKey, AutoscalerId, AutoscalerState, ClusterModel, ContainerState, PodId,
    PodState,
};
pub use decaying_histogram::DecayingHistogram;
pub use histogram::{Histogram, HistogramOptions};
pub use resources::{ResourceKind, Resources};
pub use selector::PodSelector;
