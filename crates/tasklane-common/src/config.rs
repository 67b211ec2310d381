//! Operator configuration loaded from a YAML file
//!
//! Every field has a default so a minimal file only needs the values that
//! differ per installation:
//!
//! ```yaml
//! namespace: cf-workloads
//! registrySecretName: registry-credentials
//! stagingServiceAccountName: staging
//! stagingTls:
//!   - secretName: cc-uploader-certs
//!     keyPaths:
//!       - { key: tls.crt, path: cc-uploader-cert }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Default namespace tasks are desired into
pub const DEFAULT_NAMESPACE: &str = "tasklane-workloads";

/// Default number of failed callbacks tolerated per task
pub const DEFAULT_CALLBACK_RETRY_LIMIT: u32 = 3;

/// Default grace period between task termination and Job deletion
pub const DEFAULT_TASK_TTL_SECONDS: u64 = 5;

/// Default listen address of the admission webhook
pub const DEFAULT_WEBHOOK_ADDR: &str = "0.0.0.0:8443";

/// Top-level operator configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TasklaneConfig {
    /// Namespace Jobs are created in and task pods are watched in
    pub namespace: String,
    /// Image pull secret referenced by every task pod
    pub registry_secret_name: String,
    /// Service account task pods run as
    pub staging_service_account_name: String,
    /// Certificate secrets projected into staging pods
    pub staging_tls: Vec<StagingTlsConfig>,
    /// Failed completion callbacks tolerated before reporting is abandoned
    pub callback_retry_limit: u32,
    /// Seconds a terminated task is kept before its Job is deleted
    pub task_ttl_seconds: u64,
    /// Optional CA bundle (PEM) trusted by the completion callback client
    pub callback_ca_path: Option<PathBuf>,
    /// Admission webhook server settings
    pub webhook: WebhookConfig,
}

impl Default for TasklaneConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            registry_secret_name: String::new(),
            staging_service_account_name: String::new(),
            staging_tls: Vec::new(),
            callback_retry_limit: DEFAULT_CALLBACK_RETRY_LIMIT,
            task_ttl_seconds: DEFAULT_TASK_TTL_SECONDS,
            callback_ca_path: None,
            webhook: WebhookConfig::default(),
        }
    }
}

impl TasklaneConfig {
    /// Read, parse and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the operator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::validation("namespace", "must not be empty"));
        }
        if self.task_ttl_seconds == 0 {
            return Err(Error::validation(
                "taskTtlSeconds",
                "must be greater than zero",
            ));
        }
        for tls in &self.staging_tls {
            if tls.secret_name.is_empty() {
                return Err(Error::validation("stagingTls", "secretName must be set"));
            }
        }
        Ok(())
    }

    /// Grace period as a `Duration`
    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_seconds)
    }
}

/// One certificate secret merged into the staging certs volume
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StagingTlsConfig {
    /// Name of an existing Secret in the task namespace
    pub secret_name: String,
    /// Keys of the secret to project and the file each lands in
    #[serde(default)]
    pub key_paths: Vec<KeyPath>,
}

/// Maps a secret key to a file path inside the certs volume
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct KeyPath {
    /// Key in the secret's data
    pub key: String,
    /// Relative file path in the mounted directory
    pub path: String,
}

/// Admission webhook server settings
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
    /// Address the HTTPS server binds to
    pub listen_addr: SocketAddr,
    /// Serving certificate (PEM)
    pub cert_path: PathBuf,
    /// Serving key (PEM)
    pub key_path: PathBuf,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_WEBHOOK_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8443))),
            cert_path: PathBuf::from("/etc/tasklane/certs/tls.crt"),
            key_path: PathBuf::from("/etc/tasklane/certs/tls.key"),
        }
    }
}
