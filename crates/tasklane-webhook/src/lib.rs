//! Admission webhook for Tasklane pods
//!
//! Serves a single mutating endpoint that injects `CF_INSTANCE_INDEX` into the
//! runtime container of every newly created pod.

pub mod instance_index;

use axum::{
    routing::{get, post},
    Router,
};

pub use instance_index::{mutate, WebhookError};

/// Path the `MutatingWebhookConfiguration` points at
pub const MUTATE_PODS_PATH: &str = "/mutate/pods";

/// Build the webhook router
pub fn webhook_router() -> Router {
    Router::new()
        .route(MUTATE_PODS_PATH, post(instance_index::mutate_handler))
        .route("/healthz", get(healthz))
}

async fn healthz() -> &'static str {
    "ok"
}
