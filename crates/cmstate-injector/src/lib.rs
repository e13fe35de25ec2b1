//! Reference-counted ConfigMaps for pods that share a CMTemplate
//!
//! Pods opt in with an annotation and are tracked as the audience of a
//! per-template CMState record:
//!
//! - **Admission**: pod create joins the audience, pod delete leaves it
//! - **Controller**: materializes the ConfigMap for a record with members and
//!   tears both down once the audience is empty
//! - **Registry**: in-memory CMTemplate cache shared by both paths
//! - **Owner**: suppresses a leave while the pod's controller still wants replicas

#![deny(missing_docs)]

pub mod admission;
pub mod config;
pub mod controller;
pub mod naming;
pub mod owner;
pub mod registry;
pub mod render;
pub mod store;
pub mod webhook;

pub use admission::{AdmissionHandler, Decision};
pub use config::InjectorConfig;
pub use controller::{error_policy, reconcile, Context};
pub use owner::OwnerLiveness;
pub use registry::{run_template_watcher, TemplateRegistry};
pub use store::{GroupRecordStore, KubeStore};
pub use webhook::{webhook_router, WebhookState};
