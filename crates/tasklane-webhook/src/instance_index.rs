//! Instance index injection
//!
//! Pods get a generated name ending in their ordinal (`<prefix>-<n>`). On
//! create, the ordinal is parsed from the name and appended to the runtime
//! container's env as `CF_INSTANCE_INDEX`. Every other operation passes
//! through untouched.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{EnvVar, Pod};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
};
use tracing::{debug, error, info, warn};

use tasklane_common::{ENV_CF_INSTANCE_INDEX, RUNTIME_CONTAINER_NAME};

/// Reason attached to pass-through responses
pub const ALREADY_CREATED_REASON: &str = "pod was already created";

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// The request carried no pod object
    #[error("admission request has no object")]
    MissingObject,

    /// The pod name has no dash to split the ordinal from
    #[error("could not parse app name from {0}")]
    UnparsableName(String),

    /// The pod name's final segment is not a number
    #[error("pod {0} name does not contain an index")]
    MissingIndex(String),

    /// No container named `RUNTIME_CONTAINER_NAME`
    #[error("no app container found in pod")]
    MissingContainer,

    /// An error occurred during JSON serialization/deserialization
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WebhookError {
    fn status(&self) -> StatusCode {
        match self {
            WebhookError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(serde_json::json!({"error": self.to_string()})),
        )
            .into_response()
    }
}

/// Handle a mutating admission review for pods
pub async fn mutate_handler(
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    let req: AdmissionRequest<DynamicObject> = body.try_into().map_err(|e: kube::core::admission::ConvertAdmissionReviewError| {
        error!(error = %e, "failed to parse admission request");
        WebhookError::InvalidReview(e.to_string())
    })?;

    Ok(Json(mutate(&req).into_review()))
}

/// Compute the admission response for a single request
pub fn mutate(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let uid = request.uid.clone();

    if !matches!(request.operation, Operation::Create) {
        debug!(uid = %uid, operation = ?request.operation, "not a create, allowing unchanged");
        let mut response = AdmissionResponse::from(request);
        response.result.code = StatusCode::OK.as_u16();
        response.result.reason = ALREADY_CREATED_REASON.to_string();
        return response;
    }

    match patch_for(request) {
        Ok((pod_name, ops)) => {
            info!(uid = %uid, pod = %pod_name, "injecting instance index");
            match AdmissionResponse::from(request).with_patch(json_patch::Patch(ops)) {
                Ok(response) => response,
                Err(e) => {
                    error!(uid = %uid, error = %e, "failed to serialize patch");
                    reject(request, &WebhookError::InvalidReview(e.to_string()))
                }
            }
        }
        Err(e) => {
            warn!(uid = %uid, error = %e, "rejecting pod");
            reject(request, &e)
        }
    }
}

fn patch_for(
    request: &AdmissionRequest<DynamicObject>,
) -> Result<(String, Vec<PatchOperation>), WebhookError> {
    let pod = decode_pod(request)?;
    let name = pod.metadata.name.clone().unwrap_or_default();
    let index = parse_instance_index(&name)?;

    let containers = pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();
    let (position, container) = containers
        .iter()
        .enumerate()
        .find(|(_, c)| c.name == RUNTIME_CONTAINER_NAME)
        .ok_or(WebhookError::MissingContainer)?;

    let env_len = container.env.as_ref().map(Vec::len);
    Ok((name, build_patch(position, env_len, index)?))
}

/// A rejection with a client error status and no patch
fn reject(request: &AdmissionRequest<DynamicObject>, error: &WebhookError) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(error.to_string());
    response.result.code = error.status().as_u16();
    response
}

/// Decode the request object as a pod
pub fn decode_pod(request: &AdmissionRequest<DynamicObject>) -> Result<Pod, WebhookError> {
    let object = request.object.as_ref().ok_or(WebhookError::MissingObject)?;
    let value = serde_json::to_value(object)?;
    serde_json::from_value(value).map_err(|e| WebhookError::InvalidReview(e.to_string()))
}

/// Ordinal from the segment after the final dash of a pod name
pub fn parse_instance_index(pod_name: &str) -> Result<u64, WebhookError> {
    let (_, suffix) = pod_name
        .rsplit_once('-')
        .ok_or_else(|| WebhookError::UnparsableName(pod_name.to_string()))?;

    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WebhookError::MissingIndex(pod_name.to_string()));
    }
    suffix
        .parse()
        .map_err(|_| WebhookError::MissingIndex(pod_name.to_string()))
}

/// Single `add` appending the index env entry to container `position`
///
/// `env_len` is the current env list length, `None` when the container has
/// no env list, in which case the whole list is added.
pub fn build_patch(
    position: usize,
    env_len: Option<usize>,
    index: u64,
) -> Result<Vec<PatchOperation>, WebhookError> {
    let entry = EnvVar {
        name: ENV_CF_INSTANCE_INDEX.to_string(),
        value: Some(index.to_string()),
        ..Default::default()
    };
    let position = position.to_string();

    let (path, value) = match env_len {
        Some(len) => {
            let len = len.to_string();
            (
                PointerBuf::from_tokens(["spec", "containers", position.as_str(), "env", len.as_str()]),
                serde_json::to_value(&entry)?,
            )
        }
        None => (
            PointerBuf::from_tokens(["spec", "containers", position.as_str(), "env"]),
            serde_json::to_value(vec![&entry])?,
        ),
    };

    Ok(vec![PatchOperation::Add(AddOperation { path, value })])
}
