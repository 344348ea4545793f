//! VerticalAutoscaler Custom Resource Definition
//!
//! A VerticalAutoscaler selects the pods of one workload (via `targetRef`)
//! and carries the recommender's output in its status. The recommendation
//! field is written only by the recommender; the updater and the admission
//! controller observe it through the API server.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    AutoscalerCondition, ConditionStatus, ConditionType, Recommendation, ResourcePolicy,
    TargetRef, UpdateMode, UpdatePolicy,
};

/// Specification of a VerticalAutoscaler
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "autoscaling.rightsizer.dev",
    version = "v1alpha1",
    kind = "VerticalAutoscaler",
    plural = "verticalautoscalers",
    shortname = "va",
    status = "VerticalAutoscalerStatus",
    namespaced,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.updatePolicy.updateMode"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetRef.name"}"#,
    printcolumn = r#"{"name":"Provided","type":"string","jsonPath":".status.conditions[?(@.type=='RecommendationProvided')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VerticalAutoscalerSpec {
    /// The workload whose pods this autoscaler manages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<TargetRef>,

    /// When and how recommendations are applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<UpdatePolicy>,

    /// Per-container constraints on the recommendation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<ResourcePolicy>,
}

impl VerticalAutoscaler {
    /// Effective update mode; `Auto` when the update policy is absent
    pub fn update_mode(&self) -> UpdateMode {
        self.spec
            .update_policy
            .as_ref()
            .and_then(|p| p.update_mode)
            .unwrap_or_default()
    }
}

/// Observed state of a VerticalAutoscaler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerticalAutoscalerStatus {
    /// The most recently computed recommendation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,

    /// Conditions describing the autoscaler state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<AutoscalerCondition>,
}

impl VerticalAutoscalerStatus {
    /// Set or replace a condition, updating the transition time only when
    /// the status value actually flips
    pub fn set_condition(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        message: Option<String>,
        now: DateTime<Utc>,
    ) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.last_transition_time = Some(now);
            }
            existing.status = status;
            existing.message = message;
            return;
        }
        self.conditions.push(AutoscalerCondition {
            type_,
            status,
            last_transition_time: Some(now),
            message,
        });
    }

    /// Returns the status of the named condition, if present
    pub fn condition(&self, type_: ConditionType) -> Option<ConditionStatus> {
        self.conditions
            .iter()
            .find(|c| c.type_ == type_)
            .map(|c| c.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn update_mode_defaults_to_auto() {
        let va = VerticalAutoscaler::new("va", VerticalAutoscalerSpec::default());
        assert_eq!(va.update_mode(), UpdateMode::Auto);

        let va = VerticalAutoscaler::new(
            "va",
            VerticalAutoscalerSpec {
                update_policy: Some(UpdatePolicy {
                    update_mode: Some(UpdateMode::Off),
                }),
                ..Default::default()
            },
        );
        assert_eq!(va.update_mode(), UpdateMode::Off);
    }

    #[test]
    fn set_condition_tracks_transitions() {
        let mut status = VerticalAutoscalerStatus::default();
        status.set_condition(
            ConditionType::RecommendationProvided,
            ConditionStatus::True,
            None,
            t(100),
        );
        assert_eq!(
            status.condition(ConditionType::RecommendationProvided),
            Some(ConditionStatus::True)
        );

        // Re-asserting the same value keeps the original transition time.
        status.set_condition(
            ConditionType::RecommendationProvided,
            ConditionStatus::True,
            None,
            t(200),
        );
        assert_eq!(status.conditions[0].last_transition_time, Some(t(100)));

        // A flip moves it.
        status.set_condition(
            ConditionType::RecommendationProvided,
            ConditionStatus::False,
            Some("no samples".into()),
            t(300),
        );
        assert_eq!(status.conditions[0].last_transition_time, Some(t(300)));
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn crd_uses_expected_group_and_kind() {
        use kube::CustomResourceExt;
        let crd = VerticalAutoscaler::crd();
        assert_eq!(crd.spec.group, "autoscaling.rightsizer.dev");
        assert_eq!(crd.spec.names.kind, "VerticalAutoscaler");
    }
}
