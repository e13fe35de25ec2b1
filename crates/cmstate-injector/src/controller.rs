//! CMState reconciler
//!
//! Level-triggered: every run re-reads the record and acts on its current
//! state, never on the event that woke it.
//!
//! | record                         | action                                      |
//! |--------------------------------|---------------------------------------------|
//! | gone                           | nothing                                     |
//! | deletion timestamp set         | delete the ConfigMap                        |
//! | audience empty                 | delete the record, then the ConfigMap       |
//! | no target                      | render + create ConfigMap, set target       |
//! | target set, ConfigMap missing  | render + recreate ConfigMap                 |
//! | target set, ConfigMap present  | nothing (template edits are not propagated) |

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::api::Preconditions;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use cmstate_common::crd::{CMState, Condition, ConditionStatus, CONDITION_AVAILABLE};
use cmstate_common::retry::RetryConfig;
use cmstate_common::{Error, REQUEUE_SUCCESS_SECS};

use crate::config::InjectorConfig;
use crate::registry::TemplateRegistry;
use crate::render::build_config_map;
use crate::store::GroupRecordStore;

const REASON_RECONCILED: &str = "Reconciled";
const REASON_RECONCILING: &str = "Reconciling";
const REASON_TEMPLATE_MISSING: &str = "TemplateMissing";

/// Consecutive failure counts per record, for requeue backoff
#[derive(Default)]
pub struct BackoffTracker {
    failures: DashMap<String, u32>,
}

impl BackoffTracker {
    /// Record a failure and return the delay before the next attempt
    pub fn next_delay(&self, key: &str, config: &RetryConfig) -> Duration {
        let mut failures = self.failures.entry(key.to_string()).or_insert(0);
        let delay = config.delay_for_attempt(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Forget failures after a successful run
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }
}

/// Controller context
pub struct Context {
    /// Store accessor (trait object for testability)
    pub store: Arc<dyn GroupRecordStore>,
    /// Template cache shared with the webhook
    pub registry: Arc<TemplateRegistry>,
    /// Injector settings
    pub config: InjectorConfig,
    /// Requeue backoff state
    pub backoff: BackoffTracker,
}

impl Context {
    /// Create a new controller context
    pub fn new(
        store: Arc<dyn GroupRecordStore>,
        registry: Arc<TemplateRegistry>,
        config: InjectorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            backoff: BackoffTracker::default(),
        }
    }
}

fn backoff_key(state: &CMState) -> String {
    format!(
        "{}/{}",
        state.namespace().unwrap_or_default(),
        state.name_any()
    )
}

/// Names of ConfigMaps that may belong to the record.
///
/// The record's own name is included even when `target` is empty, so a
/// ConfigMap created just before a crash (and before the target patch) is
/// still cleaned up.
fn backing_names(state: &CMState) -> Vec<String> {
    let name = state.name_any();
    let target = &state.spec.target;
    if target.is_empty() || *target == name {
        vec![name]
    } else {
        vec![target.clone(), name]
    }
}

/// Reconcile a CMState
#[instrument(skip(state, ctx), fields(state = %state.name_any()))]
pub async fn reconcile(state: Arc<CMState>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = state.name_any();
    let namespace = state.namespace().ok_or_else(|| {
        Error::internal_with_context("reconciler", format!("CMState {name} has no namespace"))
    })?;
    let key = backoff_key(&state);

    // The watch cache may lag behind the webhook's writes
    let Some(current) = ctx.store.get_state(&namespace, &name).await? else {
        debug!("CMState is gone, nothing to do");
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    };

    if current.is_deleting() {
        info!("CMState is being deleted, removing its ConfigMap");
        delete_backing(&ctx, &namespace, &current).await?;
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }

    if current.spec.audience.is_empty() {
        info!("Audience is empty, tearing down");
        // Record first, pinned to the version we read: a join since then
        // fails the delete with a conflict and both objects stay. If the
        // ConfigMap delete fails afterwards, its owner reference lets the
        // garbage collector finish the job.
        let preconditions = Preconditions {
            resource_version: current.metadata.resource_version.clone(),
            uid: current.metadata.uid.clone(),
        };
        ctx.store
            .delete_state(&namespace, &name, preconditions)
            .await?;
        delete_backing(&ctx, &namespace, &current).await?;
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }

    if current.spec.target.is_empty() {
        materialize(&ctx, &current, &name).await?;
        ctx.store.patch_target(&namespace, &name, &name).await?;
        info!(config_map = %name, "ConfigMap materialized");
    } else {
        let target = current.spec.target.clone();
        if ctx.store.get_config_map(&namespace, &target).await?.is_none() {
            warn!(config_map = %target, "ConfigMap missing, recreating");
            materialize(&ctx, &current, &target).await?;
        }
    }

    update_condition(
        &ctx,
        &current,
        Condition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::True,
            REASON_RECONCILED,
            "ConfigMap is in place",
        ),
    )
    .await?;

    ctx.backoff.reset(&key);
    Ok(Action::requeue(Duration::from_secs(REQUEUE_SUCCESS_SECS)))
}

/// Render and create the ConfigMap `cm_name`, recording failures as a condition
async fn materialize(ctx: &Context, state: &CMState, cm_name: &str) -> Result<(), Error> {
    let result = render_and_create(ctx, state, cm_name).await;

    if let Err(e) = &result {
        let reason = match e {
            Error::TemplateMissing { .. } => REASON_TEMPLATE_MISSING,
            _ => REASON_RECONCILING,
        };
        let condition = Condition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            reason,
            format!(
                "Failed to create ConfigMap for the custom resource ({}): ({})",
                state.name_any(),
                e
            ),
        );
        if let Err(status_err) = update_condition(ctx, state, condition).await {
            error!(error = %status_err, "Failed to update CMState status");
        }
    }

    result
}

async fn render_and_create(ctx: &Context, state: &CMState, cm_name: &str) -> Result<(), Error> {
    let template = &state.spec.template_ref;
    let body = ctx
        .registry
        .resolve(ctx.store.as_ref(), &ctx.config.template_namespace, template)
        .await?
        .ok_or_else(|| Error::template_missing(template.as_str()))?;

    let config_map = build_config_map(state, cm_name, &body)?;
    ctx.store.create_config_map(&config_map).await
}

async fn delete_backing(ctx: &Context, namespace: &str, state: &CMState) -> Result<(), Error> {
    for cm_name in backing_names(state) {
        ctx.store.delete_config_map(namespace, &cm_name).await?;
    }
    Ok(())
}

/// Write the condition if it changes anything
async fn update_condition(ctx: &Context, state: &CMState, condition: Condition) -> Result<(), Error> {
    let mut status = state.status_or_default();
    if !status.set_condition(condition) {
        return Ok(());
    }
    let namespace = state.namespace().unwrap_or_default();
    ctx.store
        .patch_status(&namespace, &state.name_any(), &status)
        .await
}

/// Error policy for the controller
///
/// Retryable errors back off exponentially per record; errors that need an
/// operator (a missing template) wait the full interval.
pub fn error_policy(state: Arc<CMState>, error: &Error, ctx: Arc<Context>) -> Action {
    let backoff = &ctx.config.reconcile_backoff;
    let delay = if error.is_retryable() {
        ctx.backoff.next_delay(&backoff_key(&state), backoff)
    } else {
        backoff.max_delay
    };

    error!(
        ?error,
        state = %state.name_any(),
        retry_secs = delay.as_secs(),
        "reconciliation failed"
    );

    Action::requeue(delay)
}
