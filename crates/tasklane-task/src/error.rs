//! Task-specific error types

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("job with guid {guid} should have 1 instance, but it has: {count}")]
    Cardinality { guid: String, count: usize },

    #[error("completion callback failed: {0}")]
    Callback(String),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("missing namespace on pod")]
    MissingNamespace,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TaskError {
    /// Whether the error means the object is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, TaskError::NotFound { .. })
    }
}
