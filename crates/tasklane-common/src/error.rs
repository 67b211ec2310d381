//! Error types shared across Tasklane crates
//!
//! Errors are structured with fields to aid debugging in production.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for shared Tasklane operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        /// Path that was read
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed
    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        /// Path that was parsed
        path: PathBuf,
        /// The underlying YAML error
        #[source]
        source: serde_yaml::Error,
    },

    /// Configuration is syntactically valid but unusable
    #[error("validation error for {field}: {message}")]
    Validation {
        /// The offending config key (e.g., "taskTtlSeconds")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// Telemetry could not be initialized
    #[error("failed to initialize telemetry: {0}")]
    Telemetry(String),
}

impl Error {
    /// Create a validation error for a config field
    pub fn validation(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a telemetry error with the given message
    pub fn telemetry(msg: impl Into<String>) -> Self {
        Self::Telemetry(msg.into())
    }
}
