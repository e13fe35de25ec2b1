//! Pod admission endpoint

use std::sync::Arc;

use axum::{extract::State, Json};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
};
use tracing::{debug, error, warn};

use cmstate_common::Error;

use crate::admission::Decision;

use super::WebhookState;

const CODE_TRANSIENT: u16 = 500;
const CODE_DENIED: u16 = 403;

/// Handle a mutating admission review for a pod create or delete
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = admit_pod(&state, &req).await;
    Json(response.into_review())
}

/// Run join/leave for one request and build the response
async fn admit_pod(state: &WebhookState, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    // Deletes carry the pod in oldObject
    let pod = match request.operation {
        Operation::Delete => request.old_object.as_ref(),
        _ => request.object.as_ref(),
    };
    let Some(pod) = pod else {
        debug!(uid = %request.uid, "No pod object in request, allowing unchanged");
        return AdmissionResponse::from(request);
    };

    let namespace = request
        .namespace
        .clone()
        .or_else(|| pod.metadata.namespace.clone())
        .unwrap_or_default();

    let result = state
        .handler
        .handle(&request.operation, &namespace, &pod.metadata)
        .await;
    respond(request, result)
}

/// Translate a join/leave outcome into an admission response.
///
/// Errors deny the request: 500 when the store was unavailable so the caller
/// retries, 403 otherwise.
pub fn respond(
    request: &AdmissionRequest<DynamicObject>,
    result: Result<Decision, Error>,
) -> AdmissionResponse {
    match result {
        Ok(Decision::Allow { reason }) => {
            debug!(uid = %request.uid, reason, "Allowing pod unchanged");
            AdmissionResponse::from(request)
        }
        Ok(Decision::Patch(ops)) => {
            match AdmissionResponse::from(request).with_patch(json_patch::Patch(ops)) {
                Ok(response) => response,
                Err(e) => {
                    error!(uid = %request.uid, error = %e, "Failed to serialize patch");
                    deny(request, format!("patch serialization error: {e}"), CODE_DENIED)
                }
            }
        }
        Err(e) => {
            let code = if e.is_transient() || e.is_contention() {
                CODE_TRANSIENT
            } else {
                CODE_DENIED
            };
            warn!(uid = %request.uid, error = %e, code, "Denying pod admission");
            deny(request, e.to_string(), code)
        }
    }
}

fn deny(request: &AdmissionRequest<DynamicObject>, message: String, code: u16) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = code;
    response
}
