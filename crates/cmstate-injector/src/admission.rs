//! Admission join/leave handler
//!
//! Pods opt into a CMTemplate with an annotation. On create the pod joins the
//! template's group record (creating it if needed) and is annotated with the
//! record's name; on delete it leaves the audience, unless a controller that
//! owns it still wants replicas.
//!
//! Nothing here deletes a ConfigMap or a CMState. Teardown belongs to the
//! reconciler so that this path stays short and bounded: at most a template
//! read, a record read and one write per attempt, with a single immediate
//! retry when another writer wins the race.

use std::collections::BTreeMap;
use std::sync::Arc;

use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::admission::Operation;
use tracing::{debug, info, warn};

use cmstate_common::crd::{CMAudience, CMState, CMStateSpec, TemplateBody};
use cmstate_common::kube_utils::{annotation, validate_label_value};
use cmstate_common::retry::retry_on_contention;
use cmstate_common::Error;

use crate::config::InjectorConfig;
use crate::naming::{member_name, state_name};
use crate::owner::OwnerLiveness;
use crate::registry::TemplateRegistry;
use crate::store::GroupRecordStore;

/// What the webhook should answer
#[derive(Debug, PartialEq)]
pub enum Decision {
    /// Admit unchanged
    Allow {
        /// Why nothing was mutated
        reason: &'static str,
    },
    /// Admit with these patch operations against the submitted pod
    Patch(Vec<PatchOperation>),
}

impl Decision {
    fn allow(reason: &'static str) -> Self {
        Self::Allow { reason }
    }
}

/// Join/leave logic behind the pod webhook
pub struct AdmissionHandler {
    store: Arc<dyn GroupRecordStore>,
    registry: Arc<TemplateRegistry>,
    owners: OwnerLiveness,
    config: InjectorConfig,
}

impl AdmissionHandler {
    /// Handler over the given collaborators
    pub fn new(
        store: Arc<dyn GroupRecordStore>,
        registry: Arc<TemplateRegistry>,
        owners: OwnerLiveness,
        config: InjectorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            owners,
            config,
        }
    }

    /// Dispatch on the admission operation
    pub async fn handle(
        &self,
        operation: &Operation,
        namespace: &str,
        pod: &ObjectMeta,
    ) -> Result<Decision, Error> {
        match operation {
            Operation::Create => self.join(namespace, pod).await,
            Operation::Delete => self.leave(namespace, pod).await,
            _ => Ok(Decision::allow("operation is neither create nor delete")),
        }
    }

    /// Register a new pod with its template's group
    pub async fn join(&self, namespace: &str, pod: &ObjectMeta) -> Result<Decision, Error> {
        let Some(template) = annotation(pod, &self.config.template_annotation) else {
            return Ok(Decision::allow("pod has no template annotation"));
        };
        let member = member_name(pod)
            .ok_or_else(|| Error::invalid_request("pod has neither name nor generateName"))?;

        let body = self
            .registry
            .resolve(self.store.as_ref(), &self.config.template_namespace, template)
            .await?
            .ok_or_else(|| Error::template_missing(template))?;

        let name = state_name(template);
        retry_on_contention("join", self.config.conflict_retries, || {
            self.join_once(namespace, &name, template, &member, &body, pod)
        })
        .await?;

        if body.target_annotation.is_empty() {
            return Ok(Decision::allow("template has no target annotation"));
        }
        Ok(Decision::Patch(target_annotation_patch(&body.target_annotation, &name)))
    }

    async fn join_once(
        &self,
        namespace: &str,
        name: &str,
        template: &str,
        member: &str,
        body: &TemplateBody,
        pod: &ObjectMeta,
    ) -> Result<(), Error> {
        match self.store.get_state(namespace, name).await? {
            None => {
                let state = new_state(namespace, name, template, member, body, pod)?;
                self.store.create_state(&state).await?;
                info!(state = %name, namespace = %namespace, member = %member, "Created group record");
            }
            Some(state) if state.is_deleting() => {
                return Err(Error::internal_with_context(
                    "join",
                    format!("CMState {name} is being deleted"),
                ));
            }
            Some(state) if state.spec.has_member(member) => {
                debug!(state = %name, member = %member, "Already in audience");
            }
            Some(state) => {
                let mut audience = state.spec.audience;
                audience.push(CMAudience::pod(member));
                // A record deleted since the read is a lost race like a stale
                // version: the retry re-reads and recreates it.
                self.store
                    .patch_audience(namespace, name, audience, state.metadata.resource_version)
                    .await
                    .map_err(|e| match e {
                        Error::NotFound { kind, name } => {
                            Error::conflict(kind, name, "deleted while joining")
                        }
                        other => other,
                    })?;
                info!(state = %name, namespace = %namespace, member = %member, "Joined audience");
            }
        }
        Ok(())
    }

    /// Deregister a departing pod
    pub async fn leave(&self, namespace: &str, pod: &ObjectMeta) -> Result<Decision, Error> {
        let Some(template) = annotation(pod, &self.config.template_annotation) else {
            return Ok(Decision::allow("pod has no template annotation"));
        };
        let name = state_name(template);

        let Some(state) = self.store.get_state(namespace, &name).await? else {
            return Ok(Decision::allow("no group record"));
        };

        if let Some(owners) = pod.owner_references.as_deref().filter(|o| !o.is_empty()) {
            if self.owners.any_alive(namespace, owners).await {
                debug!(state = %name, "Owner still wants replicas, keeping member");
                return Ok(Decision::allow("owner is replacing the pod"));
            }
        }

        let Some(member) = member_name(pod) else {
            return Ok(Decision::allow("pod has neither name nor generateName"));
        };

        let mut prefetched = Some(state);
        retry_on_contention("leave", self.config.conflict_retries, || {
            let cached = prefetched.take();
            self.leave_once(namespace, &name, &member, cached)
        })
        .await
    }

    async fn leave_once(
        &self,
        namespace: &str,
        name: &str,
        member: &str,
        cached: Option<CMState>,
    ) -> Result<Decision, Error> {
        let state = match cached {
            Some(state) => state,
            None => match self.store.get_state(namespace, name).await? {
                Some(state) => state,
                None => return Ok(Decision::allow("no group record")),
            },
        };

        let Some(index) = state.spec.member_index(member) else {
            return Ok(Decision::allow("pod not in audience"));
        };

        let mut audience = state.spec.audience;
        audience.remove(index);
        let remaining = audience.len();
        match self
            .store
            .patch_audience(namespace, name, audience, state.metadata.resource_version)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(Decision::allow("no group record")),
            Err(e) => return Err(e),
        }
        info!(
            state = %name,
            namespace = %namespace,
            member = %member,
            remaining = remaining,
            "Left audience"
        );
        Ok(Decision::allow("left audience"))
    }
}

/// Group record seeded with its first member.
///
/// Annotations named by the template's `annotationReplace` keys become
/// labels so the reconciler can render without seeing any pod.
fn new_state(
    namespace: &str,
    name: &str,
    template: &str,
    member: &str,
    body: &TemplateBody,
    pod: &ObjectMeta,
) -> Result<CMState, Error> {
    let mut labels = BTreeMap::new();
    for key in body.annotation_replace.keys() {
        let Some(value) = pod.annotations.as_ref().and_then(|a| a.get(key)) else {
            continue;
        };
        if let Err(reason) = validate_label_value(value) {
            warn!(
                state = %name,
                annotation = %key,
                value = %value,
                %reason,
                "Annotation is not a valid label value"
            );
            return Err(Error::invalid_request(format!(
                "annotation {key}={value:?} cannot be carried as a CMState label: {reason}"
            )));
        }
        labels.insert(key.clone(), value.clone());
    }

    let mut state = CMState::new(
        name,
        CMStateSpec {
            audience: vec![CMAudience::pod(member)],
            target: String::new(),
            template_ref: template.to_string(),
        },
    );
    state.metadata.namespace = Some(namespace.to_string());
    if !labels.is_empty() {
        state.metadata.labels = Some(labels);
    }
    Ok(state)
}

/// Patch setting the pod's target annotation to the record name
fn target_annotation_patch(target_annotation: &str, state_name: &str) -> Vec<PatchOperation> {
    vec![PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(["metadata", "annotations", target_annotation]),
        value: serde_json::Value::String(state_name.to_string()),
    })]
}
