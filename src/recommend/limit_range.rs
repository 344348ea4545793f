//! Effective LimitRange calculation
//!
//! A namespace may carry several LimitRange objects; what matters to the
//! capping pipeline is the single tightest combination: the lowest maximum,
//! the highest minimum, and the last default limit.

use k8s_openapi::api::core::v1::LimitRange;
use kube::runtime::reflector::Store;

use crate::error::Error;
use crate::model::{ResourceKind, Resources};

/// The combined constraints of all LimitRange items of one type in one
/// namespace
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EffectiveLimitRange {
    /// Highest minimum across items
    pub min: Resources,
    /// Lowest maximum across items
    pub max: Resources,
    /// Default limit, when any item declares one
    pub default: Resources,
}

impl EffectiveLimitRange {
    /// True when no constraint is present
    pub fn is_empty(&self) -> bool {
        self.min.is_empty() && self.max.is_empty() && self.default.is_empty()
    }
}

/// Provides the effective LimitRange for a namespace
pub trait LimitRangeCalculator: Send + Sync {
    /// Constraints applying to individual containers
    fn container_limit_range(&self, namespace: &str) -> Result<Option<EffectiveLimitRange>, Error>;

    /// Constraints applying to whole pods
    fn pod_limit_range(&self, namespace: &str) -> Result<Option<EffectiveLimitRange>, Error>;
}

/// Calculator that reports no constraints; used when the LimitRange cache
/// is unavailable
#[derive(Debug, Default)]
pub struct NoopLimitRangeCalculator;

impl LimitRangeCalculator for NoopLimitRangeCalculator {
    fn container_limit_range(&self, _namespace: &str) -> Result<Option<EffectiveLimitRange>, Error> {
        Ok(None)
    }

    fn pod_limit_range(&self, _namespace: &str) -> Result<Option<EffectiveLimitRange>, Error> {
        Ok(None)
    }
}

/// Calculator reading from a watch cache of LimitRange objects
pub struct StoreLimitRangeCalculator {
    store: Store<LimitRange>,
}

impl StoreLimitRangeCalculator {
    /// Wrap a synced reflector store
    pub fn new(store: Store<LimitRange>) -> Self {
        Self { store }
    }

    fn effective(
        &self,
        namespace: &str,
        limit_type: &str,
    ) -> Result<Option<EffectiveLimitRange>, Error> {
        let mut result = EffectiveLimitRange::default();
        for lr in self.store.state() {
            if lr.metadata.namespace.as_deref() != Some(namespace) {
                continue;
            }
            let Some(spec) = &lr.spec else { continue };
            for item in &spec.limits {
                if item.type_ != limit_type {
                    continue;
                }
                if let Some(default) = &item.default {
                    result.default = Resources::from_quantity_map(default)?;
                }
                if let Some(max) = &item.max {
                    let parsed = Resources::from_quantity_map(max)?;
                    for kind in ResourceKind::ALL {
                        if let Some(value) = parsed.get(kind) {
                            // The lowest maximum binds.
                            let current = result.max.get(kind).unwrap_or(i64::MAX);
                            result.max.set(kind, current.min(value));
                        }
                    }
                }
                if let Some(min) = &item.min {
                    let parsed = Resources::from_quantity_map(min)?;
                    for kind in ResourceKind::ALL {
                        if let Some(value) = parsed.get(kind) {
                            // The highest minimum binds.
                            let current = result.min.get(kind).unwrap_or(0);
                            result.min.set(kind, current.max(value));
                        }
                    }
                }
            }
        }
        Ok((!result.is_empty()).then_some(result))
    }
}

impl LimitRangeCalculator for StoreLimitRangeCalculator {
    fn container_limit_range(&self, namespace: &str) -> Result<Option<EffectiveLimitRange>, Error> {
        self.effective(namespace, "Container")
    }

    fn pod_limit_range(&self, namespace: &str) -> Result<Option<EffectiveLimitRange>, Error> {
        self.effective(namespace, "Pod")
    }
}
