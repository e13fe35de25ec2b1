//! Kubernetes utility functions
//!
//! CRD installation and a few metadata accessors shared by the webhook and
//! the reconciler.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tracing::info;

use crate::crd::{CMState, CMTemplate};
use crate::{Error, Result, FIELD_MANAGER};

/// CRD definition with name and resource
pub struct CrdDef {
    /// Fully-qualified CRD name (`<plural>.<group>`)
    pub name: &'static str,
    /// Generated definition
    pub crd: CustomResourceDefinition,
}

/// Every CRD the injector serves
pub fn all_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "cmstates.cache.spicedelver.me",
            crd: CMState::crd(),
        },
        CrdDef {
            name: "cmtemplates.cache.spicedelver.me",
            crd: CMTemplate::crd(),
        },
    ]
}

/// Install the injector's CRDs using server-side apply
pub async fn install_crds(client: &Client) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in all_crds() {
        info!(crd = def.name, "Installing CRD");
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| {
                Error::internal_with_context(
                    "install_crds",
                    format!("failed to install {} CRD: {}", def.name, e),
                )
            })?;
    }

    Ok(())
}

/// Non-empty annotation value
pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Maximum length of a label value
const LABEL_VALUE_MAX_LEN: usize = 63;

/// Check a string against the label value syntax.
///
/// Empty, or at most 63 characters of `[A-Za-z0-9._-]` that start and end
/// with an alphanumeric.
pub fn validate_label_value(value: &str) -> std::result::Result<(), String> {
    if value.len() > LABEL_VALUE_MAX_LEN {
        return Err(format!(
            "must be no more than {LABEL_VALUE_MAX_LEN} characters (got {})",
            value.len()
        ));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("contains invalid character {c:?}"));
    }
    let alnum_edges = |c: Option<char>| c.map_or(true, |c| c.is_ascii_alphanumeric());
    if !alnum_edges(value.chars().next()) || !alnum_edges(value.chars().last()) {
        return Err("must begin and end with an alphanumeric character".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn crd_names_match_generated_definitions() {
        for def in all_crds() {
            assert_eq!(def.crd.metadata.name.as_deref(), Some(def.name));
        }
    }

    #[test]
    fn empty_annotations_are_absent() {
        let meta = ObjectMeta {
            annotations: Some(BTreeMap::from([
                ("a".to_string(), "x".to_string()),
                ("b".to_string(), String::new()),
            ])),
            ..Default::default()
        };
        assert_eq!(annotation(&meta, "a"), Some("x"));
        assert_eq!(annotation(&meta, "b"), None);
        assert_eq!(annotation(&meta, "c"), None);
        assert_eq!(annotation(&ObjectMeta::default(), "a"), None);
    }

    #[test]
    fn label_values_follow_kubernetes_syntax() {
        assert!(validate_label_value("").is_ok());
        assert!(validate_label_value("worker").is_ok());
        assert!(validate_label_value("my-role_v1.2").is_ok());

        let arn = "arn:aws:iam::123456789012:role/app";
        assert!(validate_label_value(arn).unwrap_err().contains("':'"));
        assert!(validate_label_value("-lead").is_err());
        assert!(validate_label_value("trail.").is_err());
        assert!(validate_label_value(&"a".repeat(64))
            .unwrap_err()
            .contains("63"));
    }
}
