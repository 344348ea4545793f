//! Target reference resolution
//!
//! An autoscaler names its workload through `targetRef`; everything
//! downstream needs the workload's pod label selector. The seven well-known
//! controller kinds are read through their typed APIs; anything else goes
//! through the `scale` subresource, which reports an equality selector
//! string.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::ReplicationController;
use kube::api::{Api, DynamicObject};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::crd::types::TargetRef;
use crate::error::Error;
use crate::model::PodSelector;

/// Resolves a target reference to the pod selector of the workload
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetSelectorFetcher: Send + Sync {
    /// Fetch the label selector for the given target in the given namespace
    async fn fetch(&self, namespace: &str, target: &TargetRef) -> Result<PodSelector, Error>;
}

/// Fetcher backed by the Kubernetes API
pub struct ApiTargetSelectorFetcher {
    client: Client,
}

impl ApiTargetSelectorFetcher {
    /// Create a fetcher using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn from_scale_subresource(
        &self,
        namespace: &str,
        target: &TargetRef,
    ) -> Result<PodSelector, Error> {
        let api_version = target.api_version.as_deref().unwrap_or("apps/v1");
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, &target.kind);
        // Well-known kinds never reach this path, so the conventional
        // lowercase plural is the best guess available without discovery.
        let plural = format!("{}s", target.kind.to_lowercase());
        let resource = ApiResource::from_gvk_with_plural(&gvk, &plural);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let scale = api.get_subresource("scale", &target.name).await?;
        let selector = scale
            .data
            .pointer("/status/selector")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::target(format!(
                    "scale subresource of {}/{} {} reports no selector",
                    api_version, target.kind, target.name
                ))
            })?;
        PodSelector::parse_equality(selector)
    }
}

#[async_trait]
impl TargetSelectorFetcher for ApiTargetSelectorFetcher {
    async fn fetch(&self, namespace: &str, target: &TargetRef) -> Result<PodSelector, Error> {
        let client = self.client.clone();
        let name = &target.name;
        match target.kind.as_str() {
            "Deployment" => {
                let api: Api<Deployment> = Api::namespaced(client, namespace);
                let obj = api.get(name).await?;
                let selector = obj
                    .spec
                    .map(|s| s.selector)
                    .ok_or_else(|| Error::target(format!("deployment {name} has no spec")))?;
                PodSelector::from_label_selector(&selector)
            }
            "ReplicaSet" => {
                let api: Api<ReplicaSet> = Api::namespaced(client, namespace);
                let obj = api.get(name).await?;
                let selector = obj
                    .spec
                    .map(|s| s.selector)
                    .ok_or_else(|| Error::target(format!("replicaset {name} has no spec")))?;
                PodSelector::from_label_selector(&selector)
            }
            "StatefulSet" => {
                let api: Api<StatefulSet> = Api::namespaced(client, namespace);
                let obj = api.get(name).await?;
                let selector = obj
                    .spec
                    .map(|s| s.selector)
                    .ok_or_else(|| Error::target(format!("statefulset {name} has no spec")))?;
                PodSelector::from_label_selector(&selector)
            }
            "DaemonSet" => {
                let api: Api<DaemonSet> = Api::namespaced(client, namespace);
                let obj = api.get(name).await?;
                let selector = obj
                    .spec
                    .map(|s| s.selector)
                    .ok_or_else(|| Error::target(format!("daemonset {name} has no spec")))?;
                PodSelector::from_label_selector(&selector)
            }
            "ReplicationController" => {
                let api: Api<ReplicationController> = Api::namespaced(client, namespace);
                let obj = api.get(name).await?;
                let labels = obj
                    .spec
                    .and_then(|s| s.selector)
                    .ok_or_else(|| {
                        Error::target(format!("replicationcontroller {name} has no selector"))
                    })?;
                Ok(PodSelector::from_match_labels(labels))
            }
            "Job" => {
                let api: Api<Job> = Api::namespaced(client, namespace);
                let obj = api.get(name).await?;
                let selector = obj
                    .spec
                    .and_then(|s| s.selector)
                    .ok_or_else(|| Error::target(format!("job {name} has no selector")))?;
                PodSelector::from_label_selector(&selector)
            }
            "CronJob" => {
                let api: Api<CronJob> = Api::namespaced(client, namespace);
                let obj = api.get(name).await?;
                let labels = obj
                    .spec
                    .and_then(|s| s.job_template.spec)
                    .and_then(|s| s.template.metadata)
                    .and_then(|m| m.labels)
                    .ok_or_else(|| {
                        Error::target(format!("cronjob {name} has no pod template labels"))
                    })?;
                Ok(PodSelector::from_match_labels(labels))
            }
            _ => self.from_scale_subresource(namespace, target).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_fetcher_resolves_selectors() {
        let mut fetcher = MockTargetSelectorFetcher::new();
        fetcher.expect_fetch().returning(|_, _| {
            Ok(PodSelector::from_match_labels(
                [("app".to_string(), "web".to_string())].into(),
            ))
        });

        let target = TargetRef {
            api_version: Some("apps/v1".into()),
            kind: "Deployment".into(),
            name: "web".into(),
        };
        let selector = fetcher.fetch("default", &target).await.unwrap();
        assert!(selector.matches(&[("app".to_string(), "web".to_string())].into()));
    }
}
