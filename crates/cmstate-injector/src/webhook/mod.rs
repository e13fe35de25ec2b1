//! Mutating admission webhook for pods
//!
//! One endpoint handles both pod create (join) and pod delete (leave); the
//! MutatingWebhookConfiguration must register it for both operations.

pub mod pod;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use cmstate_common::WEBHOOK_PATH;

use crate::admission::AdmissionHandler;

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Join/leave logic
    pub handler: Arc<AdmissionHandler>,
}

impl WebhookState {
    /// Create a new webhook state around a handler
    pub fn new(handler: Arc<AdmissionHandler>) -> Self {
        Self { handler }
    }
}

/// Create the webhook router
///
/// - POST /mutate-v1-pod - join/leave a pod's template group
/// - GET /healthz - liveness probe
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(pod::mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}
