//! Historical usage source
//!
//! When the recommender starts with `--storage prometheus` it bootstraps
//! the cluster model from a Prometheus server instead of checkpoints: one
//! synthesised sample per returned datapoint, over a configurable horizon.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::model::resources::milli_from_cores;
use crate::model::{PodId, ResourceKind};

/// One historical datapoint for a container
#[derive(Clone, Debug, PartialEq)]
pub struct HistorySample {
    /// Sample timestamp
    pub timestamp: DateTime<Utc>,
    /// Which resource was measured
    pub resource: ResourceKind,
    /// Millicores for CPU, bytes for memory
    pub value: i64,
}

/// Usage history of one pod
#[derive(Clone, Debug, Default)]
pub struct PodHistory {
    /// Last observed labels of the pod, for aggregate keying
    pub labels: BTreeMap<String, String>,
    /// Samples per container name, oldest first
    pub container_samples: BTreeMap<String, Vec<HistorySample>>,
}

/// Source of historical per-container usage
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Fetch the full history over the configured horizon
    async fn cluster_history(&self) -> Result<BTreeMap<PodId, PodHistory>, Error>;
}

/// Configuration of the Prometheus history provider
#[derive(Clone, Debug)]
pub struct PrometheusHistoryConfig {
    /// Base address, e.g. `http://prometheus.monitoring:9090`
    pub address: String,
    /// How far back to query
    pub history_length: Duration,
    /// Query step between datapoints
    pub resolution: Duration,
    /// Metric used to discover pod labels
    pub pod_labels_metric: String,
    /// Prefix of pod label names within that metric
    pub pod_label_prefix: String,
}

impl Default for PrometheusHistoryConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            history_length: Duration::days(8),
            resolution: Duration::minutes(1),
            pod_labels_metric: "up{job=\"kubernetes-pods\"}".to_string(),
            pod_label_prefix: "pod_label_".to_string(),
        }
    }
}

/// Prometheus `query_range` response shape
#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    data: Option<PrometheusData>,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    #[serde(default)]
    result: Vec<PrometheusSeries>,
}

#[derive(Debug, Deserialize)]
struct PrometheusSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// History provider backed by a Prometheus server scraping cadvisor
pub struct PrometheusHistoryProvider {
    http: reqwest::Client,
    config: PrometheusHistoryConfig,
}

impl PrometheusHistoryProvider {
    /// Create a provider for the configured server
    pub fn new(config: PrometheusHistoryConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn query_range(&self, query: &str) -> Result<Vec<PrometheusSeries>, Error> {
        let end = Utc::now();
        let start = end - self.config.history_length;
        let url = format!("{}/api/v1/query_range", self.config.address);
        let response: PrometheusResponse = self
            .http
            .get(&url)
            .query(&[
                ("query", query.to_string()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("step", format!("{}s", self.config.resolution.num_seconds())),
            ])
            .send()
            .await
            .map_err(|e| Error::metrics(format!("prometheus request failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::metrics(format!("prometheus response malformed: {e}")))?;
        if response.status != "success" {
            return Err(Error::metrics(format!(
                "prometheus query failed with status {}",
                response.status
            )));
        }
        Ok(response.data.map(|d| d.result).unwrap_or_default())
    }

    fn fold_series(
        histories: &mut BTreeMap<PodId, PodHistory>,
        series: Vec<PrometheusSeries>,
        resource: ResourceKind,
        to_value: impl Fn(f64) -> i64,
    ) {
        for s in series {
            let (Some(namespace), Some(pod), Some(container)) = (
                s.metric.get("namespace"),
                s.metric.get("pod"),
                s.metric.get("container"),
            ) else {
                continue;
            };
            if container.is_empty() {
                continue;
            }
            let id = PodId {
                namespace: namespace.clone(),
                name: pod.clone(),
            };
            let entry = histories.entry(id).or_default();
            let samples = entry.container_samples.entry(container.clone()).or_default();
            for (ts, value) in &s.values {
                let Ok(parsed) = value.parse::<f64>() else {
                    continue;
                };
                let Some(timestamp) = Utc.timestamp_opt(*ts as i64, 0).single() else {
                    continue;
                };
                samples.push(HistorySample {
                    timestamp,
                    resource,
                    value: to_value(parsed),
                });
            }
        }
    }

    fn fold_pod_labels(&self, histories: &mut BTreeMap<PodId, PodHistory>, series: Vec<PrometheusSeries>) {
        for s in series {
            let (Some(namespace), Some(pod)) = (
                s.metric.get("kubernetes_namespace"),
                s.metric.get("kubernetes_pod_name"),
            ) else {
                continue;
            };
            let id = PodId {
                namespace: namespace.clone(),
                name: pod.clone(),
            };
            let Some(entry) = histories.get_mut(&id) else {
                continue;
            };
            for (key, value) in &s.metric {
                if let Some(label) = key.strip_prefix(&self.config.pod_label_prefix) {
                    entry.labels.insert(label.to_string(), value.clone());
                }
            }
        }
    }
}

#[async_trait]
impl HistoryProvider for PrometheusHistoryProvider {
    async fn cluster_history(&self) -> Result<BTreeMap<PodId, PodHistory>, Error> {
        let mut histories = BTreeMap::new();

        let cpu = self
            .query_range("rate(container_cpu_usage_seconds_total{container!=\"\"}[5m])")
            .await?;
        Self::fold_series(&mut histories, cpu, ResourceKind::Cpu, milli_from_cores);

        let memory = self
            .query_range("container_memory_working_set_bytes{container!=\"\"}")
            .await?;
        Self::fold_series(&mut histories, memory, ResourceKind::Memory, |bytes| {
            bytes as i64
        });

        let labels = self.query_range(&self.config.pod_labels_metric).await?;
        self.fold_pod_labels(&mut histories, labels);

        debug!(pods = histories.len(), "loaded prometheus history");
        Ok(histories)
    }
}
