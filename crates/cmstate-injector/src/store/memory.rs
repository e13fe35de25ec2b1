//! In-memory store with resourceVersion checks, for stateful tests

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Preconditions;

use cmstate_common::crd::{CMAudience, CMState, CMStateStatus, CMTemplate};
use cmstate_common::Error;

use super::GroupRecordStore;

type Key = (String, String);
type Hook = Box<dyn FnOnce(&mut Objects) + Send>;

/// Everything the store holds
#[derive(Default)]
pub(crate) struct Objects {
    pub states: HashMap<Key, CMState>,
    pub config_maps: HashMap<Key, ConfigMap>,
    pub templates: HashMap<Key, CMTemplate>,
    next_version: u64,
}

impl Objects {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    /// Insert a CMState as another writer would, stamping a fresh version
    pub fn put_state(&mut self, mut state: CMState) {
        state.metadata.resource_version = Some(self.bump());
        self.states.insert(key_of(&state.metadata), state);
    }

    /// Append a member as another writer would
    pub fn add_member(&mut self, namespace: &str, name: &str, member: &str) {
        let version = self.bump();
        if let Some(state) = self.states.get_mut(&key(namespace, name)) {
            state.spec.audience.push(CMAudience::pod(member));
            state.metadata.resource_version = Some(version);
        }
    }
}

/// Store that behaves like the API server for the operations we use
#[derive(Default)]
pub(crate) struct MemoryStore {
    objects: Mutex<Objects>,
    before_create_state: Mutex<Option<Hook>>,
    before_patch_audience: Mutex<Option<Hook>>,
    before_delete_state: Mutex<Option<Hook>>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn key_of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Key {
    key(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` right before the next `create_state` takes effect
    pub fn before_next_create_state(&self, hook: impl FnOnce(&mut Objects) + Send + 'static) {
        *self.before_create_state.lock().unwrap() = Some(Box::new(hook));
    }

    /// Run `hook` right before the next `patch_audience` takes effect
    pub fn before_next_patch_audience(&self, hook: impl FnOnce(&mut Objects) + Send + 'static) {
        *self.before_patch_audience.lock().unwrap() = Some(Box::new(hook));
    }

    /// Run `hook` right before the next `delete_state` takes effect
    pub fn before_next_delete_state(&self, hook: impl FnOnce(&mut Objects) + Send + 'static) {
        *self.before_delete_state.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn with_objects<R>(&self, f: impl FnOnce(&mut Objects) -> R) -> R {
        f(&mut self.objects.lock().unwrap())
    }

    pub fn state(&self, namespace: &str, name: &str) -> Option<CMState> {
        self.with_objects(|o| o.states.get(&key(namespace, name)).cloned())
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.with_objects(|o| o.config_maps.get(&key(namespace, name)).cloned())
    }

    pub fn insert_template(&self, template: CMTemplate) {
        self.with_objects(|o| {
            o.templates.insert(key_of(&template.metadata), template);
        });
    }

    pub fn insert_state(&self, state: CMState) {
        self.with_objects(|o| o.put_state(state));
    }

    pub fn insert_config_map(&self, config_map: ConfigMap) {
        self.with_objects(|o| {
            o.config_maps.insert(key_of(&config_map.metadata), config_map);
        });
    }

    fn run_hook(&self, slot: &Mutex<Option<Hook>>) {
        let hook = slot.lock().unwrap().take();
        if let Some(hook) = hook {
            self.with_objects(hook);
        }
    }
}

#[async_trait]
impl GroupRecordStore for MemoryStore {
    async fn get_state(&self, namespace: &str, name: &str) -> Result<Option<CMState>, Error> {
        Ok(self.state(namespace, name))
    }

    async fn create_state(&self, state: &CMState) -> Result<CMState, Error> {
        self.run_hook(&self.before_create_state);
        self.with_objects(|o| {
            let k = key_of(&state.metadata);
            if o.states.contains_key(&k) {
                return Err(Error::already_exists("CMState", k.1));
            }
            o.put_state(state.clone());
            Ok(o.states[&k].clone())
        })
    }

    async fn patch_audience(
        &self,
        namespace: &str,
        name: &str,
        audience: Vec<CMAudience>,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        self.run_hook(&self.before_patch_audience);
        self.with_objects(|o| {
            let version = o.bump();
            let state = o
                .states
                .get_mut(&key(namespace, name))
                .ok_or_else(|| Error::not_found("CMState", name))?;
            if resource_version.is_some() && resource_version != state.metadata.resource_version {
                return Err(Error::conflict("CMState", name, "resourceVersion mismatch"));
            }
            state.spec.audience = audience;
            state.metadata.resource_version = Some(version);
            Ok(())
        })
    }

    async fn patch_target(&self, namespace: &str, name: &str, target: &str) -> Result<(), Error> {
        self.with_objects(|o| {
            let version = o.bump();
            let state = o
                .states
                .get_mut(&key(namespace, name))
                .ok_or_else(|| Error::not_found("CMState", name))?;
            state.spec.target = target.to_string();
            state.metadata.resource_version = Some(version);
            Ok(())
        })
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CMStateStatus,
    ) -> Result<(), Error> {
        self.with_objects(|o| {
            let state = o
                .states
                .get_mut(&key(namespace, name))
                .ok_or_else(|| Error::not_found("CMState", name))?;
            state.status = Some(status.clone());
            Ok(())
        })
    }

    async fn delete_state(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Preconditions,
    ) -> Result<(), Error> {
        self.run_hook(&self.before_delete_state);
        self.with_objects(|o| {
            let k = key(namespace, name);
            let Some(state) = o.states.get(&k) else {
                return Ok(());
            };
            let stale = |want: &Option<String>, have: &Option<String>| {
                want.is_some() && want != have
            };
            if stale(&preconditions.resource_version, &state.metadata.resource_version)
                || stale(&preconditions.uid, &state.metadata.uid)
            {
                return Err(Error::conflict("CMState", name, "precondition failed"));
            }
            o.states.remove(&k);
            Ok(())
        })
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(self.config_map(namespace, name))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        self.with_objects(|o| {
            o.config_maps
                .entry(key_of(&config_map.metadata))
                .or_insert_with(|| config_map.clone());
        });
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.with_objects(|o| o.config_maps.remove(&key(namespace, name)));
        Ok(())
    }

    async fn get_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CMTemplate>, Error> {
        Ok(self.with_objects(|o| o.templates.get(&key(namespace, name)).cloned()))
    }
}
