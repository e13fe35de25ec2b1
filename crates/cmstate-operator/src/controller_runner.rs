//! Controller runner - builds the CMState controller future

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use cmstate_common::crd::CMState;
use cmstate_common::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_INJECTOR};
use cmstate_injector::controller::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the CMState controller
///
/// Owned ConfigMaps are watched too, so deleting a backing ConfigMap out of
/// band triggers a reconcile of its record.
pub fn build_cmstate_controller(
    client: Client,
    ctx: Arc<Context>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let states: Api<CMState> = Api::all(client.clone());
    let config_maps: Api<ConfigMap> = Api::all(client);
    let managed = format!("{LABEL_MANAGED_BY}={LABEL_MANAGED_BY_INJECTOR}");

    tracing::info!("- CMState controller");

    Box::pin(
        Controller::new(states, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .owns(
                config_maps,
                WatcherConfig::default()
                    .labels(&managed)
                    .timeout(WATCH_TIMEOUT_SECS),
            )
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("CMState")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
