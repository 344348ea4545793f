//! Inputs to the cluster model
//!
//! - [`feeder`] - synchronises the model with the API server
//! - [`metrics`] - live usage from the resource metrics API
//! - [`history`] - historical usage from Prometheus
//! - [`oom`] - OOM kill extraction from pod statuses

pub mod feeder;
pub mod history;
pub mod metrics;
pub mod oom;

pub use feeder::{watch_store, ClusterStateFeeder};
pub use history::{HistoryProvider, PrometheusHistoryConfig, PrometheusHistoryProvider};
pub use metrics::{ContainerMetricsSample, MetricsSource, PodMetricsSource};
