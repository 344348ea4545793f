//! Disruption-aware eviction
//!
//! Eviction candidates come pre-sorted by priority; this module decides
//! how many of them may actually go. Per replicated group, one tick may
//! evict at most `max(1, floor(tolerance × replicas))` pods, and the
//! running count must never drop below `max(1, minReplicas)`. Throughput
//! across all groups is bounded by a global token bucket.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Pod;
use tokio::time::Instant;
use tracing::debug;

/// Identity of the controller owning a group of replicas
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupKey {
    /// Namespace of the pods
    pub namespace: String,
    /// Kind of the controlling owner, e.g. `ReplicaSet`
    pub kind: String,
    /// Name of the controlling owner
    pub name: String,
}

/// Tunables for the per-group eviction budget
#[derive(Clone, Copy, Debug)]
pub struct EvictionConfig {
    /// Groups smaller than this are never disrupted, and eviction must not
    /// leave fewer running pods than this
    pub min_replicas: usize,
    /// Fraction of a group evictable within one tick
    pub tolerance_fraction: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            min_replicas: 2,
            tolerance_fraction: 0.5,
        }
    }
}

#[derive(Debug)]
struct GroupStats {
    configured: usize,
    running: usize,
    budget: usize,
    evicted: usize,
}

/// Per-tick eviction bookkeeping over one set of candidate pods
#[derive(Debug)]
pub struct PodsEvictionRestriction {
    config: EvictionConfig,
    groups: HashMap<GroupKey, GroupStats>,
}

impl PodsEvictionRestriction {
    /// Build the restriction from all pods matching one autoscaler
    pub fn new(config: EvictionConfig, pods: &[Pod]) -> Self {
        let mut groups: HashMap<GroupKey, GroupStats> = HashMap::new();
        for pod in pods {
            let Some(key) = controlling_group(pod) else {
                continue;
            };
            let stats = groups.entry(key).or_insert(GroupStats {
                configured: 0,
                running: 0,
                budget: 0,
                evicted: 0,
            });
            stats.configured += 1;
            if is_running(pod) {
                stats.running += 1;
            }
        }
        for stats in groups.values_mut() {
            let tolerated = (stats.configured as f64 * config.tolerance_fraction).floor() as usize;
            stats.budget = tolerated.max(1);
        }
        Self { config, groups }
    }

    /// Whether the pod may be evicted now without violating the group's
    /// disruption constraints
    pub fn can_evict(&self, pod: &Pod) -> bool {
        let Some(key) = controlling_group(pod) else {
            // Pods without a controller are not recreated; evicting them
            // would just delete them.
            return false;
        };
        let Some(stats) = self.groups.get(&key) else {
            return false;
        };
        if stats.configured < self.config.min_replicas {
            return false;
        }
        if stats.evicted >= stats.budget {
            return false;
        }
        if !is_running(pod) {
            // Pending pods hold no traffic; replacing them is free.
            return true;
        }
        let keep_alive = self.config.min_replicas.max(1);
        stats.running.saturating_sub(stats.evicted) > keep_alive
    }

    /// Record a successful eviction against the pod's group budget
    pub fn on_evicted(&mut self, pod: &Pod) {
        if let Some(key) = controlling_group(pod) {
            if let Some(stats) = self.groups.get_mut(&key) {
                stats.evicted += 1;
                debug!(
                    group = ?key,
                    evicted = stats.evicted,
                    budget = stats.budget,
                    "eviction recorded"
                );
            }
        }
    }
}

fn controlling_group(pod: &Pod) -> Option<GroupKey> {
    let owner = pod
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller == Some(true))?;
    Some(GroupKey {
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        kind: owner.kind.clone(),
        name: owner.name.clone(),
    })
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|p| p == "Running")
        .unwrap_or(false)
}

/// Global token-bucket limiter for eviction throughput. A rate ≤ 0
/// disables limiting entirely.
#[derive(Debug)]
pub struct EvictionRateLimiter {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl EvictionRateLimiter {
    /// Create a limiter allowing `rate` evictions per second with the
    /// given burst; `rate ≤ 0` disables it
    pub fn new(rate: f64, burst: usize) -> Option<Self> {
        if rate <= 0.0 {
            return None;
        }
        let burst = (burst.max(1)) as f64;
        Some(Self {
            rate,
            burst,
            tokens: burst,
            last_refill: Instant::now(),
        })
    }

    /// Take one token, sleeping until one is available
    pub async fn acquire(&mut self) {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return;
        }
        let wait_secs = (1.0 - self.tokens) / self.rate;
        tokio::time::sleep(std::time::Duration::from_secs_f64(wait_secs)).await;
        self.refill();
        self.tokens = (self.tokens - 1.0).max(0.0);
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;

    fn replica_pod(name: &str, owner: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".into(),
                    kind: "ReplicaSet".into(),
                    name: owner.into(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
        }
    }

    fn group_of(n: usize) -> Vec<Pod> {
        (0..n)
            .map(|i| replica_pod(&format!("web-{i}"), "web-rs", "Running"))
            .collect()
    }

    #[test]
    fn tolerance_bounds_evictions_per_tick() {
        // Group of 10 with tolerance 0.5: at most 5 evictions, 5 remain.
        let pods = group_of(10);
        let mut restriction = PodsEvictionRestriction::new(EvictionConfig::default(), &pods);

        let mut evicted = 0;
        for pod in &pods {
            if restriction.can_evict(pod) {
                restriction.on_evicted(pod);
                evicted += 1;
            }
        }
        assert_eq!(evicted, 5);
    }

    #[test]
    fn small_group_allows_single_eviction() {
        // Group of 3, tolerance 0.5: floor is 1, and one eviction keeps
        // 2 = minReplicas running.
        let pods = group_of(3);
        let mut restriction = PodsEvictionRestriction::new(EvictionConfig::default(), &pods);
        let mut evicted = 0;
        for pod in &pods {
            if restriction.can_evict(pod) {
                restriction.on_evicted(pod);
                evicted += 1;
            }
        }
        assert_eq!(evicted, 1);
    }

    #[test]
    fn never_drops_running_below_min_replicas() {
        // Group of 2 with minReplicas 2: untouchable.
        let pods = group_of(2);
        let restriction = PodsEvictionRestriction::new(EvictionConfig::default(), &pods);
        assert!(pods.iter().all(|p| !restriction.can_evict(p)));
    }

    #[test]
    fn min_replicas_one_keeps_last_pod_running() {
        let config = EvictionConfig {
            min_replicas: 1,
            tolerance_fraction: 1.0,
        };
        let pods = group_of(2);
        let mut restriction = PodsEvictionRestriction::new(config, &pods);
        let mut evicted = 0;
        for pod in &pods {
            if restriction.can_evict(pod) {
                restriction.on_evicted(pod);
                evicted += 1;
            }
        }
        // Budget would allow 2, the keep-alive floor stops at 1.
        assert_eq!(evicted, 1);
    }

    #[test]
    fn pending_pods_are_freely_replaceable() {
        let mut pods = group_of(3);
        pods.push(replica_pod("web-pending", "web-rs", "Pending"));
        let restriction = PodsEvictionRestriction::new(EvictionConfig::default(), &pods);
        assert!(restriction.can_evict(&pods[3]));
    }

    #[test]
    fn ownerless_pods_are_never_evicted() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("loner".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let restriction =
            PodsEvictionRestriction::new(EvictionConfig::default(), &[pod.clone()]);
        assert!(!restriction.can_evict(&pod));
    }

    #[test]
    fn zero_or_negative_rate_disables_limiter() {
        assert!(EvictionRateLimiter::new(0.0, 1).is_none());
        assert!(EvictionRateLimiter::new(-1.0, 1).is_none());
        assert!(EvictionRateLimiter::new(2.0, 3).is_some());
    }

    #[tokio::test]
    async fn limiter_allows_burst_without_waiting() {
        let mut limiter = EvictionRateLimiter::new(1.0, 3).unwrap();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed().as_millis() < 100, "burst should not block");
    }
}
