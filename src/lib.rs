//! Rightsizer - vertical pod autoscaling for Kubernetes
//!
//! Rightsizer observes container CPU and memory usage, aggregates it into
//! decaying histograms, and keeps pod resource requests in line with what
//! the workload actually needs. Three cooperating processes share this
//! library and communicate only through the API server:
//!
//! - the **recommender** builds an in-memory cluster model from live and
//!   historical usage and periodically writes bounded recommendations onto
//!   [`crd::VerticalAutoscaler`] statuses;
//! - the **updater** evicts pods whose requests drifted outside the
//!   recommended range, under disruption-aware budgets;
//! - the **admission controller** mutates pod-creation requests so
//!   recreated pods start with the recommended requests.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (VerticalAutoscaler, AutoscalerCheckpoint)
//! - [`model`] - in-memory cluster model and decaying histograms
//! - [`input`] - feeder, metrics source, history source, OOM extraction
//! - [`recommend`] - estimators, capping pipeline, recommender loop
//! - [`checkpoint`] - checkpoint writer
//! - [`update`] - update priority, eviction budgets, updater loop
//! - [`target`] - targetRef to pod selector resolution
//! - [`admission`] - mutating webhook server
//! - [`telemetry`] - prometheus metrics
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod admission;
pub mod checkpoint;
pub mod crd;
pub mod error;
pub mod input;
pub mod model;
pub mod recommend;
pub mod target;
pub mod telemetry;
pub mod update;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default tick period of the recommender loop, in seconds
pub const DEFAULT_RECOMMENDER_INTERVAL_SECS: u64 = 60;

/// Default tick period of the updater loop, in seconds
pub const DEFAULT_UPDATER_INTERVAL_SECS: u64 = 60;

/// Default port of the admission webhook HTTPS server
pub const DEFAULT_WEBHOOK_PORT: u16 = 8000;
