//! Live container usage source
//!
//! The recommender pulls one short usage window per tick from the cluster's
//! resource metrics API (`metrics.k8s.io`). The trait seam keeps the feeder
//! testable without a live API server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::model::resources::{parse_quantity, ResourceKind};

/// One container's usage over the most recent metrics window
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerMetricsSample {
    /// Namespace of the pod
    pub namespace: String,
    /// Name of the pod
    pub pod_name: String,
    /// Name of the container
    pub container_name: String,
    /// Start of the measurement window
    pub timestamp: DateTime<Utc>,
    /// CPU usage in millicores
    pub cpu_milli: i64,
    /// Memory working set in bytes
    pub memory_bytes: i64,
}

/// Source of live per-container usage
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Fetch one usage window for every container in the cluster
    async fn container_usage(&self) -> Result<Vec<ContainerMetricsSample>, Error>;
}

/// The relevant slice of a `PodMetrics` object
#[derive(Debug, Deserialize)]
struct PodMetricsPayload {
    timestamp: DateTime<Utc>,
    #[serde(default)]
    containers: Vec<ContainerMetricsPayload>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetricsPayload {
    name: String,
    usage: UsagePayload,
}

#[derive(Debug, Deserialize)]
struct UsagePayload {
    cpu: Quantity,
    memory: Quantity,
}

/// Reads `metrics.k8s.io/v1beta1` PodMetrics through the dynamic API
pub struct PodMetricsSource {
    api: Api<DynamicObject>,
}

impl PodMetricsSource {
    /// Create a source listing pod metrics across all namespaces
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
        Self {
            api: Api::all_with(client, &resource),
        }
    }
}

#[async_trait]
impl MetricsSource for PodMetricsSource {
    async fn container_usage(&self) -> Result<Vec<ContainerMetricsSample>, Error> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::metrics(format!("listing pod metrics: {e}")))?;

        let mut samples = Vec::new();
        for item in list.items {
            let namespace = item.metadata.namespace.clone().unwrap_or_default();
            let pod_name = item.metadata.name.clone().unwrap_or_default();
            let payload: PodMetricsPayload = serde_json::from_value(item.data.clone())
                .map_err(|e| Error::metrics(format!("decoding pod metrics: {e}")))?;
            for container in payload.containers {
                let cpu_milli = parse_quantity(ResourceKind::Cpu, &container.usage.cpu)
                    .map_err(|e| Error::metrics(e.to_string()))?;
                let memory_bytes = parse_quantity(ResourceKind::Memory, &container.usage.memory)
                    .map_err(|e| Error::metrics(e.to_string()))?;
                samples.push(ContainerMetricsSample {
                    namespace: namespace.clone(),
                    pod_name: pod_name.clone(),
                    container_name: container.name,
                    timestamp: payload.timestamp,
                    cpu_milli,
                    memory_bytes,
                });
            }
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_metrics_payload_decodes_api_shape() {
        let json = serde_json::json!({
            "timestamp": "2024-05-01T12:00:00Z",
            "window": "30s",
            "containers": [
                {"name": "app", "usage": {"cpu": "250m", "memory": "128Mi"}},
                {"name": "sidecar", "usage": {"cpu": "1500000n", "memory": "10485760"}}
            ]
        });
        let payload: PodMetricsPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.containers.len(), 2);
        assert_eq!(payload.containers[0].name, "app");
        assert_eq!(
            parse_quantity(ResourceKind::Cpu, &payload.containers[1].usage.cpu).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn mock_source_feeds_fixed_samples() {
        let mut source = MockMetricsSource::new();
        source.expect_container_usage().returning(|| {
            Ok(vec![ContainerMetricsSample {
                namespace: "default".into(),
                pod_name: "web-1".into(),
                container_name: "app".into(),
                timestamp: Utc::now(),
                cpu_milli: 200,
                memory_bytes: 128 << 20,
            }])
        });
        let samples = source.container_usage().await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].cpu_milli, 200);
    }
}
