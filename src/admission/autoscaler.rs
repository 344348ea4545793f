//! Autoscaler validation path
//!
//! Validates submitted VerticalAutoscaler objects and patches in the
//! default update policy when absent. Unlike the pod path, invalid
//! submissions are denied with an explanatory message: letting a broken
//! config in would silently disable autoscaling for its target.

use std::sync::Arc;

use axum::{extract::State, Json};
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use tracing::{debug, info, warn};

use crate::crd::types::{UpdateMode, UpdatePolicy};
use crate::crd::VerticalAutoscaler;
use crate::error::Error;
use crate::model::resources::{parse_quantity, ResourceKind};
use crate::telemetry::metrics;

use super::AdmissionState;

/// Handle a mutating admission review for autoscaler create/update
pub async fn mutate_handler(
    State(_state): State<Arc<AdmissionState>>,
    Json(body): Json<AdmissionReview<VerticalAutoscaler>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<VerticalAutoscaler> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            // An unparseable autoscaler is an invalid one; deny it.
            warn!(error = %e, "unparseable autoscaler admission review, denying");
            metrics()
                .admission_reviews
                .with_label_values(&["autoscaler", "denied"])
                .inc();
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = mutate_autoscaler(&req);
    Json(response.into_review())
}

fn mutate_autoscaler(req: &AdmissionRequest<VerticalAutoscaler>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let Some(va) = &req.object else {
        debug!(uid = %req.uid, "no autoscaler in request, allowing unchanged");
        return response;
    };

    let is_create = matches!(req.operation, Operation::Create);
    if let Err(e) = validate(va, is_create) {
        info!(uid = %req.uid, error = %e, "denying invalid autoscaler");
        metrics()
            .admission_reviews
            .with_label_values(&["autoscaler", "denied"])
            .inc();
        return response.deny(e.to_string());
    }

    let mut patches = Vec::new();
    if va.spec.update_policy.is_none() {
        // Default policy: apply recommendations automatically.
        patches.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["spec", "updatePolicy"]),
            value: serde_json::to_value(UpdatePolicy {
                update_mode: Some(UpdateMode::Auto),
            })
            .unwrap_or_default(),
        }));
    }
    if patches.is_empty() {
        metrics()
            .admission_reviews
            .with_label_values(&["autoscaler", "skipped"])
            .inc();
        return response;
    }
    match response.with_patch(json_patch::Patch(patches)) {
        Ok(patched) => {
            metrics()
                .admission_reviews
                .with_label_values(&["autoscaler", "applied"])
                .inc();
            patched
        }
        Err(e) => {
            warn!(uid = %req.uid, error = %e, "patch serialization failed, allowing unchanged");
            metrics()
                .admission_reviews
                .with_label_values(&["autoscaler", "error"])
                .inc();
            AdmissionResponse::from(req)
        }
    }
}

/// Validate an autoscaler spec; the update and scaling mode enumerations
/// are enforced at deserialization, so only cross-field rules remain
fn validate(va: &VerticalAutoscaler, is_create: bool) -> Result<(), Error> {
    if is_create && va.spec.target_ref.is_none() {
        return Err(Error::validation("targetRef is required"));
    }
    if let Some(target) = &va.spec.target_ref {
        if target.kind.is_empty() || target.name.is_empty() {
            return Err(Error::validation("targetRef needs both kind and name"));
        }
    }
    let Some(policy) = &va.spec.resource_policy else {
        return Ok(());
    };
    for container_policy in &policy.container_policies {
        if container_policy.container_name.is_empty() {
            return Err(Error::validation(
                "containerPolicies entries need a containerName",
            ));
        }
        for kind in ResourceKind::ALL {
            let min = container_policy
                .min_allowed
                .get(kind.name())
                .map(|q| parse_quantity(kind, q))
                .transpose()?;
            let max = container_policy
                .max_allowed
                .get(kind.name())
                .map(|q| parse_quantity(kind, q))
                .transpose()?;
            if let (Some(min), Some(max)) = (min, max) {
                if max < min {
                    return Err(Error::validation(format!(
                        "max allowed {} for container {:?} is lower than min allowed",
                        kind, container_policy.container_name
                    )));
                }
            }
        }
    }
    Ok(())
}
