//! Common types for the CMState injector: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group shared by the CMState and CMTemplate CRDs
pub const API_GROUP: &str = "cache.spicedelver.me";

/// Consumer annotation naming the CMTemplate a pod opts into
pub const TEMPLATE_ANNOTATION: &str = "cache.spicedelver.me/cmtemplate";

/// Prefix of every generated CMState (and backing ConfigMap) name
pub const STATE_NAME_PREFIX: &str = "cmstate";

/// Field manager used for server-side apply and merge patches
pub const FIELD_MANAGER: &str = "cmstate-injector";

/// Default port for the mutating admission webhook
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// Path the MutatingWebhookConfiguration points at
pub const WEBHOOK_PATH: &str = "/mutate-v1-pod";

/// Label key marking resources created by the injector
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] for injector-owned resources
pub const LABEL_MANAGED_BY_INJECTOR: &str = "cmstate-injector";

/// Requeue interval for a materialized CMState (drift detection)
pub const REQUEUE_SUCCESS_SECS: u64 = 300;
