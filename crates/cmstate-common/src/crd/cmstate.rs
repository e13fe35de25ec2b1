//! CMState CRD: the reference-counted group record
//!
//! A CMState is created by the admission webhook when the first pod opts into
//! a CMTemplate in a namespace. The webhook owns `spec.audience`; the
//! reconciler owns `spec.target`, `status` and the record's deletion.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus};

/// Condition type reporting whether the backing ConfigMap is materialized
pub const CONDITION_AVAILABLE: &str = "Available";

/// Spec for a CMState
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cache.spicedelver.me",
    version = "v1alpha1",
    kind = "CMState",
    plural = "cmstates",
    shortname = "cms",
    namespaced,
    status = "CMStateStatus",
    printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.templateRef"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.target"}"#,
    printcolumn = r#"{"name":"Audience","type":"string","jsonPath":".spec.audience[*].name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CMStateSpec {
    /// Registered consumers, unique by name
    #[serde(default)]
    pub audience: Vec<CMAudience>,

    /// Name of the materialized ConfigMap; empty until the first reconcile
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,

    /// CMTemplate this group renders from (immutable after creation)
    #[serde(default)]
    pub template_ref: String,
}

/// One registered consumer
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CMAudience {
    /// Consumer kind; informational only
    pub kind: String,
    /// Consumer name; the uniqueness key within an audience
    pub name: String,
}

impl CMAudience {
    /// Audience entry for a pod
    pub fn pod(name: impl Into<String>) -> Self {
        Self {
            kind: "Pod".to_string(),
            name: name.into(),
        }
    }
}

/// Status for a CMState
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CMStateStatus {
    /// Reconciliation conditions, at most one per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl CMStateStatus {
    /// Insert or replace the condition of the same type.
    ///
    /// The previous transition time is kept when the status does not change.
    /// Returns false when the stored condition already says the same thing.
    pub fn set_condition(&mut self, mut condition: Condition) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) if existing.same_state(&condition) => false,
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
                true
            }
            None => {
                self.conditions.push(condition);
                true
            }
        }
    }

    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True when the Available condition is True
    pub fn is_available(&self) -> bool {
        self.condition(CONDITION_AVAILABLE)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

impl CMStateSpec {
    /// True if a member with this name is registered
    pub fn has_member(&self, name: &str) -> bool {
        self.audience.iter().any(|a| a.name == name)
    }

    /// Position of the member with this name
    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.audience.iter().position(|a| a.name == name)
    }
}

impl CMState {
    /// True once the API server has set a deletion timestamp
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Conditions, or an empty status if none has been written yet
    pub fn status_or_default(&self) -> CMStateStatus {
        self.status.clone().unwrap_or_default()
    }
}
