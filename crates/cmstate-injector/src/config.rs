//! Runtime configuration shared by the webhook and the reconciler

use cmstate_common::retry::RetryConfig;
use cmstate_common::TEMPLATE_ANNOTATION;

/// Settings injected into the webhook state and the controller context
#[derive(Clone, Debug)]
pub struct InjectorConfig {
    /// Pod annotation naming the CMTemplate to join
    pub template_annotation: String,
    /// Namespace CMTemplates are read from
    pub template_namespace: String,
    /// Immediate retries after losing an optimistic-concurrency race
    pub conflict_retries: u32,
    /// Requeue backoff for failing reconciliations
    pub reconcile_backoff: RetryConfig,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            template_annotation: TEMPLATE_ANNOTATION.to_string(),
            template_namespace: "default".to_string(),
            conflict_retries: 1,
            reconcile_backoff: RetryConfig::reconcile_backoff(),
        }
    }
}

impl InjectorConfig {
    /// Config reading templates from `namespace`
    pub fn with_template_namespace(namespace: impl Into<String>) -> Self {
        Self {
            template_namespace: namespace.into(),
            ..Default::default()
        }
    }
}
