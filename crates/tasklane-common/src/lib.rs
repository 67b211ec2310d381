//! Common types for Tasklane: well-known keys, errors, configuration and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod telemetry;

pub use config::TasklaneConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Labels
// =============================================================================
// Labels are the only identity used to find workloads again: generated Job
// names carry a random suffix and cannot be predicted.

/// Label carrying the per-task correlation GUID (the `APP_ID` env value)
pub const LABEL_GUID: &str = "tasklane.dev/guid";

/// Label carrying the application GUID
pub const LABEL_APP_GUID: &str = "tasklane.dev/app-guid";

/// Label distinguishing plain tasks from staging tasks
pub const LABEL_SOURCE_TYPE: &str = "tasklane.dev/source-type";

/// Label carrying the task GUID of a staging workload
pub const LABEL_STAGING_GUID: &str = "tasklane.dev/staging-guid";

/// `LABEL_SOURCE_TYPE` value for plain tasks
pub const SOURCE_TYPE_TASK: &str = "TASK";

/// `LABEL_SOURCE_TYPE` value for staging tasks
pub const SOURCE_TYPE_STAGING: &str = "STG";

// =============================================================================
// Annotations
// =============================================================================

/// Annotation carrying the application name
pub const ANNOTATION_APP_NAME: &str = "tasklane.dev/app-name";

/// Annotation carrying the application GUID
pub const ANNOTATION_APP_ID: &str = "tasklane.dev/app-guid";

/// Annotation carrying the org name
pub const ANNOTATION_ORG_NAME: &str = "tasklane.dev/org-name";

/// Annotation carrying the org GUID
pub const ANNOTATION_ORG_GUID: &str = "tasklane.dev/org-guid";

/// Annotation carrying the space name
pub const ANNOTATION_SPACE_NAME: &str = "tasklane.dev/space-name";

/// Annotation carrying the space GUID
pub const ANNOTATION_SPACE_GUID: &str = "tasklane.dev/space-guid";

// =============================================================================
// Environment variables
// =============================================================================
// These names are read by the task images themselves and must not change.

/// Env entry whose value becomes the task's `LABEL_GUID`
pub const ENV_APP_ID: &str = "APP_ID";

/// Pod name, injected via the downward API
pub const ENV_POD_NAME: &str = "POD_NAME";

/// Pod IP, injected via the downward API
pub const ENV_CF_INSTANCE_IP: &str = "CF_INSTANCE_IP";

/// Pod IP, injected via the downward API
pub const ENV_CF_INSTANCE_INTERNAL_IP: &str = "CF_INSTANCE_INTERNAL_IP";

/// Instance address placeholder (tasks expose no ports)
pub const ENV_CF_INSTANCE_ADDR: &str = "CF_INSTANCE_ADDR";

/// Instance port placeholder (tasks expose no ports)
pub const ENV_CF_INSTANCE_PORT: &str = "CF_INSTANCE_PORT";

/// Instance port list, always an empty JSON list for tasks
pub const ENV_CF_INSTANCE_PORTS: &str = "CF_INSTANCE_PORTS";

/// Instance ordinal injected by the admission webhook
pub const ENV_CF_INSTANCE_INDEX: &str = "CF_INSTANCE_INDEX";

/// URL the reporter calls once the task has terminated
pub const ENV_COMPLETION_CALLBACK: &str = "COMPLETION_CALLBACK";

// =============================================================================
// Container names
// =============================================================================

/// Container running a plain task; also the container the reconciler watches
pub const TASK_CONTAINER_NAME: &str = "task";

/// First staging init container
pub const DOWNLOADER_CONTAINER_NAME: &str = "task-downloader";

/// Second staging init container, carries the task's resource shape
pub const EXECUTOR_CONTAINER_NAME: &str = "task-executor";

/// Staging main container
pub const UPLOADER_CONTAINER_NAME: &str = "task-uploader";

/// Runtime container the admission webhook injects the instance index into
pub const RUNTIME_CONTAINER_NAME: &str = "app";
