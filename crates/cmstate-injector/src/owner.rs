//! Ownership liveness check
//!
//! A departing pod whose controller still wants replicas is being replaced,
//! not removed, so its leave is suppressed. Each owner kind contributes a
//! [`ReplicaSource`] reporting its desired replica count; the
//! [`OwnerLiveness`] registry dispatches on the owner reference's kind.

use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use cmstate_common::Error;

/// Desired-replica capability of one owner kind
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReplicaSource: Send + Sync {
    /// Desired replicas of the named owner.
    ///
    /// `Ok(None)` means the kind has no replica concept and existence alone
    /// counts as alive. A missing owner is [`Error::NotFound`].
    async fn desired_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>, Error>;
}

/// Workload types that may own pods
pub trait ScalingOwner {
    /// Desired replicas, or `None` for kinds without a replica count
    fn desired_replicas(&self) -> Option<i32>;
}

// An unset replicas field defaults to 1 on the API server.
impl ScalingOwner for Deployment {
    fn desired_replicas(&self) -> Option<i32> {
        Some(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }
}

impl ScalingOwner for StatefulSet {
    fn desired_replicas(&self) -> Option<i32> {
        Some(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }
}

impl ScalingOwner for ReplicaSet {
    fn desired_replicas(&self) -> Option<i32> {
        Some(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }
}

impl ScalingOwner for DaemonSet {
    fn desired_replicas(&self) -> Option<i32> {
        None
    }
}

/// [`ReplicaSource`] reading a namespaced workload from the API server
pub struct KubeOwner<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeOwner<K> {
    /// Source for owner kind `K`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K> ReplicaSource for KubeOwner<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + ScalingOwner
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    <K as Resource>::DynamicType: Default,
{
    async fn desired_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>, Error> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let kind = K::kind(&Default::default()).to_string();
        let owner = api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(&kind, name, e))?
            .ok_or_else(|| Error::not_found(kind, name))?;
        Ok(owner.desired_replicas())
    }
}

/// Owner-kind dispatch for the liveness check
#[derive(Default, Clone)]
pub struct OwnerLiveness {
    sources: HashMap<String, Arc<dyn ReplicaSource>>,
}

impl OwnerLiveness {
    /// Empty registry; every owner is treated as not alive
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for the built-in apps/v1 controllers
    pub fn for_cluster(client: Client) -> Self {
        Self::new()
            .with_source("Deployment", Arc::new(KubeOwner::<Deployment>::new(client.clone())))
            .with_source("StatefulSet", Arc::new(KubeOwner::<StatefulSet>::new(client.clone())))
            .with_source("ReplicaSet", Arc::new(KubeOwner::<ReplicaSet>::new(client.clone())))
            .with_source("DaemonSet", Arc::new(KubeOwner::<DaemonSet>::new(client)))
    }

    /// Register the source for an owner kind
    pub fn with_source(mut self, kind: impl Into<String>, source: Arc<dyn ReplicaSource>) -> Self {
        self.sources.insert(kind.into(), source);
        self
    }

    /// Whether one owner still wants pods.
    ///
    /// Unknown kinds and fetch errors count as not alive.
    pub async fn is_alive(&self, namespace: &str, owner: &OwnerReference) -> bool {
        let Some(source) = self.sources.get(&owner.kind) else {
            debug!(kind = %owner.kind, owner = %owner.name, "Owner kind has no liveness source");
            return false;
        };

        match source.desired_replicas(namespace, &owner.name).await {
            Ok(Some(replicas)) => replicas != 0,
            Ok(None) => true,
            Err(e) => {
                warn!(
                    kind = %owner.kind,
                    owner = %owner.name,
                    namespace = %namespace,
                    error = %e,
                    "Failed to read owner, treating as not alive"
                );
                false
            }
        }
    }

    /// Whether any of the owners is still alive
    pub async fn any_alive(&self, namespace: &str, owners: &[OwnerReference]) -> bool {
        for owner in owners {
            if self.is_alive(namespace, owner).await {
                return true;
            }
        }
        false
    }
}
