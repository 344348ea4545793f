//! Pod mutation path
//!
//! Rewrites the resource requests of newly created pods to the controlling
//! autoscaler's capped recommendation, scales declared limits to preserve
//! the request:limit ratio, and records what changed in an annotation.
//!
//! For one pod spec and one observed autoscaler status this is a pure
//! function: concurrent admissions produce byte-identical patches.

use std::sync::Arc;

use axum::{extract::State, Json};
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, error, info};

use crate::crd::VerticalAutoscaler;
use crate::model::resources::{format_quantity, Resources};
use crate::recommend::capping::{self, proportional_limit};
use crate::recommend::{logic, CappedRecommendation, EffectiveLimitRange};
use crate::telemetry::metrics;

use super::{AdmissionState, UPDATES_ANNOTATION};

/// Handle a mutating admission review for pod creation
pub async fn mutate_handler(
    State(state): State<Arc<AdmissionState>>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Pod> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "unparseable pod admission review, allowing");
            metrics()
                .admission_reviews
                .with_label_values(&["pod", "error"])
                .inc();
            let mut response = AdmissionResponse::invalid(e.to_string());
            // Pod creation is never blocked by this webhook.
            response.allowed = true;
            return Json(response.into_review());
        }
    };

    let response = mutate_pod(&state, &req).await;
    Json(response.into_review())
}

async fn mutate_pod(state: &AdmissionState, req: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let Some(pod) = &req.object else {
        debug!(uid = %req.uid, "no pod in request, allowing unchanged");
        return response;
    };
    let namespace = req
        .namespace
        .clone()
        .or_else(|| pod.metadata.namespace.clone())
        .unwrap_or_default();

    let Some(controlling) = controlling_autoscaler(state, &namespace, pod).await else {
        debug!(uid = %req.uid, "no matching autoscaler, allowing unchanged");
        metrics()
            .admission_reviews
            .with_label_values(&["pod", "skipped"])
            .inc();
        return response;
    };
    let va_name = controlling.name_any();

    let Some(recommendation) = controlling
        .status
        .as_ref()
        .and_then(|s| s.recommendation.as_ref())
    else {
        debug!(uid = %req.uid, autoscaler = %va_name, "no recommendation yet, allowing unchanged");
        metrics()
            .admission_reviews
            .with_label_values(&["pod", "skipped"])
            .inc();
        return response;
    };

    // Full capping pipeline with the namespace LimitRange; a calculator
    // failure degrades to policy-only capping rather than blocking the pod.
    let container_range = state
        .limit_ranges
        .container_limit_range(&namespace)
        .unwrap_or_default();
    let pod_range = state.limit_ranges.pod_limit_range(&namespace).unwrap_or_default();
    let raw = logic::from_api_recommendation(recommendation);
    let capped = capping::apply(
        &raw,
        controlling.spec.resource_policy.as_ref(),
        container_range.as_ref(),
        pod_range.as_ref(),
    );

    let patches = build_pod_patches(pod, &va_name, &capped, container_range.as_ref());
    if patches.is_empty() {
        metrics()
            .admission_reviews
            .with_label_values(&["pod", "skipped"])
            .inc();
        return response;
    }

    info!(
        uid = %req.uid,
        autoscaler = %va_name,
        patches = patches.len(),
        "mutating pod resources"
    );
    match response.with_patch(json_patch::Patch(patches)) {
        Ok(patched) => {
            metrics()
                .admission_reviews
                .with_label_values(&["pod", "applied"])
                .inc();
            patched
        }
        Err(e) => {
            error!(uid = %req.uid, error = %e, "patch serialization failed, allowing unchanged");
            metrics()
                .admission_reviews
                .with_label_values(&["pod", "error"])
                .inc();
            AdmissionResponse::from(req)
        }
    }
}

/// Find the single autoscaler controlling this pod: in-namespace, mode not
/// `Off`, selector matches; the oldest by creation timestamp wins ties,
/// then the lexicographically smallest name for determinism.
async fn controlling_autoscaler(
    state: &AdmissionState,
    namespace: &str,
    pod: &Pod,
) -> Option<Arc<VerticalAutoscaler>> {
    let mut best: Option<Arc<VerticalAutoscaler>> = None;
    for va in state.autoscalers.state() {
        if va.metadata.namespace.as_deref() != Some(namespace) {
            continue;
        }
        if va.update_mode() == crate::crd::types::UpdateMode::Off {
            continue;
        }
        let Some(target) = &va.spec.target_ref else {
            continue;
        };
        let selector = match state.selector_fetcher.fetch(namespace, target).await {
            Ok(selector) => selector,
            Err(e) => {
                debug!(autoscaler = %va.name_any(), error = %e, "cannot resolve selector, skipping");
                continue;
            }
        };
        if !selector.matches(pod.labels()) {
            continue;
        }
        let better = match &best {
            None => true,
            Some(current) => {
                let current_key = (
                    current.metadata.creation_timestamp.as_ref().map(|t| t.0),
                    current.name_any(),
                );
                let candidate_key = (
                    va.metadata.creation_timestamp.as_ref().map(|t| t.0),
                    va.name_any(),
                );
                candidate_key < current_key
            }
        };
        if better {
            best = Some(va);
        }
    }
    best
}

/// Build the JSON patch installing the capped recommendation into the pod
fn build_pod_patches(
    pod: &Pod,
    va_name: &str,
    capped: &CappedRecommendation,
    container_range: Option<&EffectiveLimitRange>,
) -> Vec<PatchOperation> {
    let mut patches = Vec::new();
    let mut update_summaries = Vec::new();
    let default_limits = container_range.map(|r| r.default).unwrap_or_default();

    let containers = pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or(&[]);
    for (index, container) in containers.iter().enumerate() {
        let Some(rec) = capped.containers.get(&container.name) else {
            continue;
        };
        if rec.target.is_empty() {
            continue;
        }
        let mut annotations: Vec<String> = capped
            .annotations
            .get(&container.name)
            .cloned()
            .unwrap_or_default();

        let declared_requests = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .map(|m| Resources::from_quantity_map(m).unwrap_or_default())
            .unwrap_or_default();
        let declared_limits = container
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .map(|m| Resources::from_quantity_map(m).unwrap_or_default())
            .unwrap_or_default();

        let has_resources = container.resources.is_some();
        let has_requests = container
            .resources
            .as_ref()
            .is_some_and(|r| r.requests.is_some());
        let has_limits = container
            .resources
            .as_ref()
            .is_some_and(|r| r.limits.is_some());

        if !has_resources {
            patches.push(add_op(
                PointerBuf::from_tokens(["spec", "containers", &index.to_string(), "resources"]),
                serde_json::json!({}),
            ));
        }
        if !has_requests {
            patches.push(add_op(
                PointerBuf::from_tokens([
                    "spec",
                    "containers",
                    &index.to_string(),
                    "resources",
                    "requests",
                ]),
                serde_json::json!({}),
            ));
        }

        for (kind, value) in rec.target.iter() {
            patches.push(add_op(
                PointerBuf::from_tokens([
                    "spec",
                    "containers",
                    &index.to_string(),
                    "resources",
                    "requests",
                    kind.name(),
                ]),
                serde_json::Value::String(format_quantity(kind, value).0),
            ));
            annotations.push(format!("{kind} request"));
        }

        // Limits scale proportionally to the declared request:limit ratio;
        // without a declared limit or a LimitRange default the limits path
        // is left untouched.
        let mut limit_patches = Vec::new();
        for (kind, target) in rec.target.iter() {
            let Some(limit) = proportional_limit(
                declared_limits.get(kind),
                declared_requests.get(kind),
                target,
                default_limits.get(kind),
            ) else {
                continue;
            };
            limit_patches.push(add_op(
                PointerBuf::from_tokens([
                    "spec",
                    "containers",
                    &index.to_string(),
                    "resources",
                    "limits",
                    kind.name(),
                ]),
                serde_json::Value::String(format_quantity(kind, limit).0),
            ));
            annotations.push(format!("{kind} limit"));
        }
        if !limit_patches.is_empty() && !has_limits {
            patches.push(add_op(
                PointerBuf::from_tokens([
                    "spec",
                    "containers",
                    &index.to_string(),
                    "resources",
                    "limits",
                ]),
                serde_json::json!({}),
            ));
        }
        patches.extend(limit_patches);

        update_summaries.push(format!("container {}: {}", index, annotations.join(", ")));
    }

    if update_summaries.is_empty() {
        return Vec::new();
    }

    let annotation_value = format!(
        "Pod resources updated by {}: {}",
        va_name,
        update_summaries.join("; ")
    );
    if pod.metadata.annotations.is_none() {
        patches.push(add_op(
            PointerBuf::from_tokens(["metadata", "annotations"]),
            serde_json::json!({ UPDATES_ANNOTATION: annotation_value }),
        ));
    } else {
        patches.push(add_op(
            PointerBuf::from_tokens(["metadata", "annotations", UPDATES_ANNOTATION]),
            serde_json::Value::String(annotation_value),
        ));
    }
    patches
}

fn add_op(path: PointerBuf, value: serde_json::Value) -> PatchOperation {
    PatchOperation::Add(AddOperation { path, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;
    use crate::recommend::RecommendedContainerResources;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn pod_with_cpu_request(request: Option<&str>, limit: Option<&str>) -> Pod {
        let requests =
            request.map(|r| BTreeMap::from([("cpu".to_string(), Quantity(r.to_string()))]));
        let limits = limit.map(|l| BTreeMap::from([("cpu".to_string(), Quantity(l.to_string()))]));
        let resources = if requests.is_some() || limits.is_some() {
            Some(ResourceRequirements {
                requests,
                limits,
                ..Default::default()
            })
        } else {
            None
        };
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some("web-1".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    resources,
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        }
    }

    fn capped_cpu(target: i64) -> CappedRecommendation {
        CappedRecommendation {
            containers: BTreeMap::from([(
                "app".to_string(),
                RecommendedContainerResources {
                    target: Resources::new(Some(target), None),
                    lower_bound: Resources::new(Some(target / 2), None),
                    upper_bound: Resources::new(Some(target * 2), None),
                    uncapped_target: Resources::new(Some(target), None),
                },
            )]),
            annotations: BTreeMap::new(),
        }
    }

    fn paths(patches: &[PatchOperation]) -> Vec<String> {
        patches
            .iter()
            .map(|p| match p {
                PatchOperation::Add(a) => a.path.to_string(),
                other => panic!("unexpected op {other:?}"),
            })
            .collect()
    }

    #[test]
    fn sets_request_without_touching_limits() {
        // Scenario: request 100m, no limits, recommendation 300m.
        let pod = pod_with_cpu_request(Some("100m"), None);
        let patches = build_pod_patches(&pod, "my-va", &capped_cpu(300), None);

        let all = paths(&patches);
        assert!(all.contains(&"/spec/containers/0/resources/requests/cpu".to_string()));
        assert!(
            all.iter().all(|p| !p.contains("limits")),
            "limits must not be touched: {all:?}"
        );

        // The request value is the capped target.
        let request_patch = patches
            .iter()
            .find_map(|p| match p {
                PatchOperation::Add(a)
                    if a.path.to_string() == "/spec/containers/0/resources/requests/cpu" =>
                {
                    Some(a.value.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(request_patch, serde_json::json!("300m"));

        // The annotation names the autoscaler and the mutated field.
        let annotation = patches
            .iter()
            .find_map(|p| match p {
                PatchOperation::Add(a) if a.path.to_string() == "/metadata/annotations" => {
                    Some(a.value.clone())
                }
                _ => None,
            })
            .unwrap();
        let value = annotation[UPDATES_ANNOTATION].as_str().unwrap();
        assert!(value.contains("my-va"));
        assert!(value.contains("container 0: cpu request"));
    }

    #[test]
    fn initializes_missing_resources_objects() {
        let pod = pod_with_cpu_request(None, None);
        let patches = build_pod_patches(&pod, "my-va", &capped_cpu(300), None);
        let all = paths(&patches);
        assert_eq!(all[0], "/spec/containers/0/resources");
        assert_eq!(all[1], "/spec/containers/0/resources/requests");
    }

    #[test]
    fn scales_declared_limits_proportionally() {
        // request 100m, limit 200m: ratio 2 carries to the new request.
        let pod = pod_with_cpu_request(Some("100m"), Some("200m"));
        let patches = build_pod_patches(&pod, "my-va", &capped_cpu(300), None);

        let limit_patch = patches
            .iter()
            .find_map(|p| match p {
                PatchOperation::Add(a)
                    if a.path.to_string() == "/spec/containers/0/resources/limits/cpu" =>
                {
                    Some(a.value.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(limit_patch, serde_json::json!("600m"));
    }

    #[test]
    fn limit_range_default_applies_when_no_limit_declared() {
        let pod = pod_with_cpu_request(Some("100m"), None);
        let mut range = EffectiveLimitRange::default();
        range.default.set(ResourceKind::Cpu, 500);

        let patches = build_pod_patches(&pod, "my-va", &capped_cpu(300), Some(&range));
        let all = paths(&patches);
        // The limits object is created and filled from the default.
        assert!(all.contains(&"/spec/containers/0/resources/limits".to_string()));
        assert!(all.contains(&"/spec/containers/0/resources/limits/cpu".to_string()));
    }

    #[test]
    fn no_recommendation_for_container_means_no_patches() {
        let pod = pod_with_cpu_request(Some("100m"), None);
        let capped = CappedRecommendation::default();
        assert!(build_pod_patches(&pod, "my-va", &capped, None).is_empty());
    }

    #[test]
    fn patches_are_deterministic_for_same_inputs() {
        let pod = pod_with_cpu_request(Some("100m"), Some("150m"));
        let capped = capped_cpu(300);
        let a = build_pod_patches(&pod, "my-va", &capped, None);
        let b = build_pod_patches(&pod, "my-va", &capped, None);
        assert_eq!(
            serde_json::to_string(&json_patch::Patch(a)).unwrap(),
            serde_json::to_string(&json_patch::Patch(b)).unwrap()
        );
    }
}
