//! Custom Resource Definitions for rightsizer
//!
//! Two CRDs make up the persistent surface: [`VerticalAutoscaler`] carries
//! the user's policy and the recommender's output; [`AutoscalerCheckpoint`]
//! persists aggregated usage histograms across recommender restarts.

mod autoscaler;
mod checkpoint;
pub mod types;

pub use autoscaler::{VerticalAutoscaler, VerticalAutoscalerSpec, VerticalAutoscalerStatus};
pub use checkpoint::{
    AutoscalerCheckpoint, AutoscalerCheckpointSpec, AutoscalerCheckpointStatus,
    HistogramCheckpoint, CHECKPOINT_VERSION,
};
