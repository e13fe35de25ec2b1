//! In-memory CMTemplate registry
//!
//! A DashMap keyed by template name, fed by a watcher task over the
//! template namespace. Readers never touch the API server except through
//! [`TemplateRegistry::resolve`], which falls back to a single store read on a
//! cold cache and remembers the result.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use cmstate_common::crd::{CMTemplate, TemplateBody};
use cmstate_common::Error;

use crate::store::GroupRecordStore;

/// Thread-safe template cache
#[derive(Default)]
pub struct TemplateRegistry {
    templates: DashMap<String, Arc<TemplateBody>>,
}

impl TemplateRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a template
    pub fn upsert(&self, name: impl Into<String>, body: TemplateBody) {
        self.templates.insert(name.into(), Arc::new(body));
    }

    /// Remove a template
    pub fn evict(&self, name: &str) {
        self.templates.remove(name);
    }

    /// Cached template, if known
    pub fn get(&self, name: &str) -> Option<Arc<TemplateBody>> {
        self.templates.get(name).map(|t| Arc::clone(t.value()))
    }

    /// Replace the whole map, dropping templates not in `templates`
    pub fn replace_all(&self, templates: HashMap<String, Arc<TemplateBody>>) {
        self.templates.retain(|name, _| templates.contains_key(name));
        for (name, body) in templates {
            self.templates.insert(name, body);
        }
    }

    /// Number of cached templates
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// True when no template is cached
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Cached template, or one read from the store and cached.
    ///
    /// `Ok(None)` means the template does not exist.
    pub async fn resolve(
        &self,
        store: &dyn GroupRecordStore,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<TemplateBody>>, Error> {
        if let Some(body) = self.get(name) {
            return Ok(Some(body));
        }

        debug!(template = %name, "Template not cached, reading from store");
        match store.get_template(namespace, name).await? {
            Some(template) => {
                let body = Arc::new(template.spec.template);
                self.templates.insert(name.to_string(), Arc::clone(&body));
                Ok(Some(body))
            }
            None => Ok(None),
        }
    }
}

/// Applies watcher events to a registry, buffering initial lists
pub struct RegistrySync {
    registry: Arc<TemplateRegistry>,
    init: Option<HashMap<String, Arc<TemplateBody>>>,
}

impl RegistrySync {
    /// Sync state for `registry`
    pub fn new(registry: Arc<TemplateRegistry>) -> Self {
        Self {
            registry,
            init: None,
        }
    }

    /// Apply one watcher event
    pub fn apply(&mut self, event: Event<CMTemplate>) {
        match event {
            Event::Init => {
                self.init = Some(HashMap::new());
            }
            Event::InitApply(template) => {
                let name = template.name_any();
                let body = Arc::new(template.spec.template);
                match self.init.as_mut() {
                    Some(buffer) => {
                        buffer.insert(name, body);
                    }
                    None => {
                        self.registry.templates.insert(name, body);
                    }
                }
            }
            Event::InitDone => {
                if let Some(buffer) = self.init.take() {
                    info!(templates = buffer.len(), "Template registry rebuilt");
                    self.registry.replace_all(buffer);
                }
            }
            Event::Apply(template) => {
                let name = template.name_any();
                debug!(template = %name, "Template added/modified");
                self.registry.upsert(name, template.spec.template);
            }
            Event::Delete(template) => {
                let name = template.name_any();
                debug!(template = %name, "Template deleted");
                self.registry.evict(&name);
            }
        }
    }
}

/// Watch CMTemplates in `namespace` and keep `registry` current.
///
/// Runs until the watch stream ends; watch errors are logged and the stream
/// backs off and relists by itself.
pub async fn run_template_watcher(
    client: Client,
    namespace: String,
    registry: Arc<TemplateRegistry>,
) {
    let api: Api<CMTemplate> = Api::namespaced(client, &namespace);
    let mut stream = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut sync = RegistrySync::new(registry);

    info!(namespace = %namespace, "Starting template watcher");

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => sync.apply(event),
            Err(e) => warn!(error = %e, "Template watch error"),
        }
    }

    warn!("Template watcher stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockGroupRecordStore;
    use cmstate_common::crd::CMTemplateSpec;
    use std::collections::BTreeMap;

    fn body(target: &str) -> TemplateBody {
        TemplateBody {
            content: BTreeMap::from([("a".to_string(), "x".to_string())]),
            annotation_replace: BTreeMap::new(),
            target_annotation: target.to_string(),
        }
    }

    fn template(name: &str, target: &str) -> CMTemplate {
        let mut t = CMTemplate::new(
            name,
            CMTemplateSpec {
                template: body(target),
            },
        );
        t.metadata.namespace = Some("cmstate-system".to_string());
        t
    }

    #[test]
    fn upsert_get_evict() {
        let registry = TemplateRegistry::new();
        registry.upsert("vault", body("t1"));
        assert_eq!(registry.get("vault").unwrap().target_annotation, "t1");

        registry.upsert("vault", body("t2"));
        assert_eq!(registry.get("vault").unwrap().target_annotation, "t2");
        assert_eq!(registry.len(), 1);

        registry.evict("vault");
        assert!(registry.get("vault").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn story_relist_drops_templates_deleted_while_disconnected() {
        let registry = Arc::new(TemplateRegistry::new());
        registry.upsert("stale", body("s"));
        registry.upsert("kept", body("old"));

        let mut sync = RegistrySync::new(Arc::clone(&registry));
        sync.apply(Event::Init);
        sync.apply(Event::InitApply(template("kept", "new")));
        sync.apply(Event::InitApply(template("fresh", "f")));

        // Nothing swapped until the relist completes
        assert!(registry.get("stale").is_some());

        sync.apply(Event::InitDone);
        assert!(registry.get("stale").is_none());
        assert_eq!(registry.get("kept").unwrap().target_annotation, "new");
        assert!(registry.get("fresh").is_some());
    }

    #[test]
    fn story_watch_events_upsert_and_evict() {
        let registry = Arc::new(TemplateRegistry::new());
        let mut sync = RegistrySync::new(Arc::clone(&registry));

        sync.apply(Event::Apply(template("vault", "t")));
        assert!(registry.get("vault").is_some());

        sync.apply(Event::Delete(template("vault", "t")));
        assert!(registry.get("vault").is_none());
    }

    #[tokio::test]
    async fn resolve_prefers_cache() {
        let registry = TemplateRegistry::new();
        registry.upsert("vault", body("t"));

        let mut store = MockGroupRecordStore::new();
        store.expect_get_template().never();

        let found = registry.resolve(&store, "cmstate-system", "vault").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn resolve_falls_back_to_store_and_caches() {
        let registry = TemplateRegistry::new();

        let mut store = MockGroupRecordStore::new();
        store
            .expect_get_template()
            .withf(|ns, name| ns == "cmstate-system" && name == "vault")
            .times(1)
            .returning(|_, _| Ok(Some(template("vault", "t"))));

        let found = registry.resolve(&store, "cmstate-system", "vault").await.unwrap();
        assert_eq!(found.unwrap().target_annotation, "t");
        // Second lookup is served from the cache
        assert!(registry.resolve(&store, "cmstate-system", "vault").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resolve_reports_missing_template() {
        let registry = TemplateRegistry::new();
        let mut store = MockGroupRecordStore::new();
        store.expect_get_template().returning(|_, _| Ok(None));

        let found = registry.resolve(&store, "cmstate-system", "nope").await.unwrap();
        assert!(found.is_none());
        assert!(registry.is_empty());
    }
}
