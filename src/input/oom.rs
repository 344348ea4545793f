//! OOM kill extraction
//!
//! Container statuses carry the last termination state; a recent
//! `OOMKilled` reason means the current memory recommendation was too low
//! and must be bumped immediately rather than waiting for histogram mass
//! to accumulate.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

use crate::model::PodId;

/// Termination reason the kubelet reports for out-of-memory kills
pub const OOM_KILLED_REASON: &str = "OOMKilled";

/// One observed OOM kill
#[derive(Clone, Debug, PartialEq)]
pub struct OomEvent {
    /// The pod the kill happened in
    pub pod_id: PodId,
    /// The killed container
    pub container_name: String,
    /// When the killed process had started
    pub started_at: Option<DateTime<Utc>>,
    /// When the kill happened
    pub finished_at: DateTime<Utc>,
}

/// Extract OOM kills recorded in a pod's container statuses
pub fn extract_ooms(pod: &Pod) -> Vec<OomEvent> {
    let mut events = Vec::new();
    let Some(status) = &pod.status else {
        return events;
    };
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let name = pod.metadata.name.clone().unwrap_or_default();
    for container_status in status.container_statuses.iter().flatten() {
        let Some(terminated) = container_status
            .last_state
            .as_ref()
            .and_then(|s| s.terminated.as_ref())
        else {
            continue;
        };
        if terminated.reason.as_deref() != Some(OOM_KILLED_REASON) {
            continue;
        }
        let Some(finished_at) = terminated.finished_at.as_ref() else {
            continue;
        };
        events.push(OomEvent {
            pod_id: PodId {
                namespace: namespace.clone(),
                name: name.clone(),
            },
            container_name: container_status.name.clone(),
            started_at: terminated.started_at.as_ref().map(|t| t.0),
            finished_at: finished_at.0,
        });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn pod_with_termination(reason: Option<&str>, finished: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-1".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".into(),
                    last_state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            reason: reason.map(String::from),
                            started_at: Some(Time(Utc::now())),
                            finished_at: finished.then(|| Time(Utc::now())),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn extracts_oom_killed_terminations() {
        let pod = pod_with_termination(Some(OOM_KILLED_REASON), true);
        let events = extract_ooms(&pod);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].container_name, "app");
        assert_eq!(events[0].pod_id.name, "web-1");
    }

    #[test]
    fn ignores_other_terminations_and_missing_timestamps() {
        assert!(extract_ooms(&pod_with_termination(Some("Error"), true)).is_empty());
        assert!(extract_ooms(&pod_with_termination(None, true)).is_empty());
        assert!(extract_ooms(&pod_with_termination(Some(OOM_KILLED_REASON), false)).is_empty());
        assert!(extract_ooms(&Pod::default()).is_empty());
    }
}
