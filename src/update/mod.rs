//! Pod update machinery
//!
//! - [`priority`] - which pods deserve a restart, and in what order
//! - [`eviction`] - disruption-aware per-group budgets and rate limiting
//! - [`updater`] - the tick loop driving evictions

pub mod eviction;
pub mod priority;
pub mod updater;

pub use eviction::{EvictionConfig, EvictionRateLimiter, PodsEvictionRestriction};
pub use priority::{PodPriority, UpdateConfig, UpdatePriorityCalculator};
pub use updater::{Updater, UpdaterConfig};
