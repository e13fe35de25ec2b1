//! Store accessor for group records, ConfigMaps and templates
//!
//! All writes to a CMState are field-level merge patches. The webhook's
//! audience patches carry the resourceVersion it read, so a concurrent writer
//! surfaces as [`Error::Conflict`] instead of being overwritten; the
//! reconciler's target and status patches touch fields nobody else writes and
//! go without a precondition. Deleting a record is guarded by its
//! resourceVersion so a join that lands after the reconciler's read survives.

#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, Preconditions};
use kube::Client;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use cmstate_common::crd::{CMAudience, CMState, CMStateStatus, CMTemplate};
use cmstate_common::{Error, FIELD_MANAGER};

const KIND_STATE: &str = "CMState";
const KIND_CONFIG_MAP: &str = "ConfigMap";
const KIND_TEMPLATE: &str = "CMTemplate";

/// Trait abstracting store operations for the webhook and reconciler
///
/// Absence is `Ok(None)` on reads and success on deletes. Creates report
/// [`Error::AlreadyExists`] for group records, which callers treat as
/// contention; ConfigMap creation treats an existing object as success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GroupRecordStore: Send + Sync {
    /// Get a CMState by namespace and name
    async fn get_state(&self, namespace: &str, name: &str) -> Result<Option<CMState>, Error>;

    /// Create a CMState
    async fn create_state(&self, state: &CMState) -> Result<CMState, Error>;

    /// Replace `spec.audience`, guarded by `resource_version` when given
    async fn patch_audience(
        &self,
        namespace: &str,
        name: &str,
        audience: Vec<CMAudience>,
        resource_version: Option<String>,
    ) -> Result<(), Error>;

    /// Set `spec.target`
    async fn patch_target(&self, namespace: &str, name: &str, target: &str) -> Result<(), Error>;

    /// Merge-patch the status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CMStateStatus,
    ) -> Result<(), Error>;

    /// Delete a CMState if it still matches `preconditions`.
    ///
    /// A record changed since it was read fails with [`Error::Conflict`].
    async fn delete_state(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Preconditions,
    ) -> Result<(), Error>;

    /// Get a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Create a ConfigMap
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), Error>;

    /// Delete a ConfigMap
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a CMTemplate
    async fn get_template(&self, namespace: &str, name: &str)
        -> Result<Option<CMTemplate>, Error>;
}

/// Real store implementation backed by the Kubernetes API
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new store with the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn states(&self, namespace: &str) -> Api<CMState> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn tolerate_not_found(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Body of an audience merge patch
fn audience_patch(audience: &[CMAudience], resource_version: Option<&str>) -> serde_json::Value {
    match resource_version {
        Some(rv) => json!({
            "metadata": { "resourceVersion": rv },
            "spec": { "audience": audience }
        }),
        None => json!({ "spec": { "audience": audience } }),
    }
}

#[async_trait]
impl GroupRecordStore for KubeStore {
    async fn get_state(&self, namespace: &str, name: &str) -> Result<Option<CMState>, Error> {
        self.states(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(KIND_STATE, name, e))
    }

    async fn create_state(&self, state: &CMState) -> Result<CMState, Error> {
        let namespace = state.metadata.namespace.as_deref().unwrap_or_default();
        let name = state.metadata.name.as_deref().unwrap_or_default();
        self.states(namespace)
            .create(&PostParams::default(), state)
            .await
            .map_err(|e| Error::from_kube(KIND_STATE, name, e))
    }

    async fn patch_audience(
        &self,
        namespace: &str,
        name: &str,
        audience: Vec<CMAudience>,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let patch = audience_patch(&audience, resource_version.as_deref());
        self.states(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(KIND_STATE, name, e))?;
        Ok(())
    }

    async fn patch_target(&self, namespace: &str, name: &str, target: &str) -> Result<(), Error> {
        let patch = json!({ "spec": { "target": target } });
        self.states(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(KIND_STATE, name, e))?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CMStateStatus,
    ) -> Result<(), Error> {
        let patch = json!({ "status": status });
        self.states(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(KIND_STATE, name, e))?;
        Ok(())
    }

    async fn delete_state(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Preconditions,
    ) -> Result<(), Error> {
        let params = DeleteParams {
            preconditions: Some(preconditions),
            ..Default::default()
        };
        let result = self
            .states(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(KIND_STATE, name, e));
        tolerate_not_found(result)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        self.config_maps(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(KIND_CONFIG_MAP, name, e))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let namespace = config_map.metadata.namespace.as_deref().unwrap_or_default();
        let name = config_map.metadata.name.as_deref().unwrap_or_default();
        match self
            .config_maps(namespace)
            .create(&PostParams::default(), config_map)
            .await
            .map_err(|e| Error::from_kube(KIND_CONFIG_MAP, name, e))
        {
            Ok(_) => Ok(()),
            Err(Error::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let result = self
            .config_maps(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(KIND_CONFIG_MAP, name, e));
        tolerate_not_found(result)
    }

    async fn get_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CMTemplate>, Error> {
        let api: Api<CMTemplate> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::from_kube(KIND_TEMPLATE, name, e))
    }
}
