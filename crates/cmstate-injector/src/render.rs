//! Render a group's backing ConfigMap from its template

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use cmstate_common::crd::{CMState, TemplateBody};
use cmstate_common::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_INJECTOR};

/// Substitute every placeholder in every content value.
///
/// Each `annotationReplace` entry maps a consumer annotation to a token; the
/// token is replaced with the group label of the same name, or with the empty
/// string if the group carries no such label. Empty tokens are ignored.
pub fn render_content(
    body: &TemplateBody,
    labels: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    body.content
        .iter()
        .map(|(key, template)| {
            let rendered = body
                .annotation_replace
                .iter()
                .filter(|(_, token)| !token.is_empty())
                .fold(template.clone(), |acc, (annotation, token)| {
                    let value = labels.get(annotation).map(String::as_str).unwrap_or("");
                    acc.replace(token.as_str(), value)
                });
            (key.clone(), rendered)
        })
        .collect()
}

/// Build the ConfigMap `name` for `state`, controlled by the record.
pub fn build_config_map(
    state: &CMState,
    name: &str,
    body: &TemplateBody,
) -> Result<ConfigMap, Error> {
    let namespace = state.namespace().ok_or_else(|| {
        Error::internal_with_context("render", format!("CMState {} has no namespace", state.name_any()))
    })?;

    let data = render_content(body, state.labels());

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                LABEL_MANAGED_BY_INJECTOR.to_string(),
            )])),
            owner_references: state.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmstate_common::crd::{CMAudience, CMStateSpec};

    fn body(content: &[(&str, &str)], replace: &[(&str, &str)]) -> TemplateBody {
        TemplateBody {
            content: content
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotation_replace: replace
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            target_annotation: "cmstate/target".to_string(),
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn story_placeholder_filled_from_group_label() {
        let body = body(&[("a", "role=${R}")], &[("role-label", "${R}")]);
        let data = render_content(&body, &labels(&[("role-label", "worker")]));
        assert_eq!(data["a"], "role=worker");
    }

    #[test]
    fn story_unresolved_placeholder_becomes_empty() {
        let body = body(&[("a", "role=${R};env=${E}")], &[("role", "${R}"), ("env", "${E}")]);
        let data = render_content(&body, &labels(&[("role", "db")]));
        assert_eq!(data["a"], "role=db;env=");
    }

    #[test]
    fn every_value_and_every_occurrence_is_replaced() {
        let body = body(
            &[("config.hcl", "${R} ${R}"), ("init.hcl", "exit=${R}")],
            &[("role", "${R}")],
        );
        let data = render_content(&body, &labels(&[("role", "x")]));
        assert_eq!(data["config.hcl"], "x x");
        assert_eq!(data["init.hcl"], "exit=x");
    }

    #[test]
    fn empty_token_leaves_content_alone() {
        let body = body(&[("a", "literal")], &[("role", "")]);
        let data = render_content(&body, &labels(&[("role", "x")]));
        assert_eq!(data["a"], "literal");
    }

    #[test]
    fn config_map_named_after_record_and_marked_managed() {
        let mut state = CMState::new(
            "cmstate-vault",
            CMStateSpec {
                audience: vec![CMAudience::pod("web-")],
                target: String::new(),
                template_ref: "vault".to_string(),
            },
        );
        state.metadata.namespace = Some("apps".to_string());
        state.metadata.uid = Some("uid-1".to_string());
        state.metadata.labels = Some(labels(&[("role", "api")]));

        let cm = build_config_map(
            &state,
            "cmstate-vault",
            &body(&[("a", "r=${R}")], &[("role", "${R}")]),
        )
        .unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("cmstate-vault"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("apps"));
        assert_eq!(
            cm.metadata.labels.as_ref().unwrap()[LABEL_MANAGED_BY],
            LABEL_MANAGED_BY_INJECTOR
        );
        let owner = &cm.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "CMState");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(cm.data.unwrap()["a"], "r=api");
    }

    #[test]
    fn config_map_requires_namespace() {
        let state = CMState::new("cmstate-vault", CMStateSpec::default());
        assert!(build_config_map(&state, "cmstate-vault", &TemplateBody::default()).is_err());
    }
}
