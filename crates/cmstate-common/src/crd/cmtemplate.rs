//! CMTemplate CRD: how a group's ConfigMap is rendered

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Spec for a CMTemplate
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cache.spicedelver.me",
    version = "v1alpha1",
    kind = "CMTemplate",
    plural = "cmtemplates",
    shortname = "cmt",
    namespaced,
    printcolumn = r#"{"name":"TargetAnnotation","type":"string","jsonPath":".spec.template.targetAnnotation"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CMTemplateSpec {
    /// Rendering rules
    #[serde(default)]
    pub template: TemplateBody,
}

/// Rendering rules for a backing ConfigMap
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateBody {
    /// ConfigMap key to template string containing placeholders
    #[serde(default)]
    pub content: BTreeMap<String, String>,

    /// Consumer annotation name to the placeholder token it fills
    #[serde(default)]
    pub annotation_replace: BTreeMap<String, String>,

    /// Annotation written back onto joining pods with the CMState name
    #[serde(default)]
    pub target_annotation: String,
}
