//! Recommendation computation
//!
//! - [`estimator`] - percentile and confidence-multiplier estimators
//! - [`logic`] - per-container recommendation assembly
//! - [`capping`] - policy and LimitRange capping pipeline
//! - [`limit_range`] - effective namespace LimitRange calculation
//! - [`recommender`] - the control loop publishing recommendations

pub mod capping;
pub mod estimator;
pub mod limit_range;
pub mod logic;
pub mod recommender;

pub use capping::{CappedRecommendation, CappingAnnotations};
pub use limit_range::{
    EffectiveLimitRange, LimitRangeCalculator, NoopLimitRangeCalculator,
    StoreLimitRangeCalculator,
};
pub use logic::{PodResourceRecommender, RecommendedContainerResources, RecommendedResources};
pub use recommender::{Recommender, RecommenderConfig};
