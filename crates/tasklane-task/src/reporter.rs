//! Completion callback reporting
//!
//! A finished task is reported by POSTing a `TaskCompletedRequest` to the URL
//! the platform placed in the task container's `COMPLETION_CALLBACK` env.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerStateTerminated, Pod};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use tasklane_common::{TasklaneConfig, ENV_COMPLETION_CALLBACK, LABEL_GUID, TASK_CONTAINER_NAME};

use crate::error::TaskError;

/// Reports the outcome of a terminated task pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, pod: &Pod) -> Result<(), TaskError>;
}

/// Body POSTed to the completion callback
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletedRequest {
    pub task_guid: String,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_reason: String,
}

impl TaskCompletedRequest {
    /// Build the request from the task container's terminated state
    pub fn from_terminated(task_guid: &str, terminated: &ContainerStateTerminated) -> Self {
        let failed = terminated.exit_code != 0;
        let failure_reason = if failed {
            terminated
                .message
                .clone()
                .filter(|m| !m.is_empty())
                .or_else(|| terminated.reason.clone().filter(|r| !r.is_empty()))
                .unwrap_or_else(|| format!("exit code {}", terminated.exit_code))
        } else {
            String::new()
        };

        Self {
            task_guid: task_guid.to_string(),
            failed,
            failure_reason,
        }
    }
}

/// `Reporter` that calls the task's completion callback over HTTP
pub struct CallbackReporter {
    http: reqwest::Client,
    task_container_name: String,
}

impl CallbackReporter {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            task_container_name: TASK_CONTAINER_NAME.to_string(),
        }
    }

    /// Build a reporter, trusting `callbackCaPath` when configured
    pub fn from_config(config: &TasklaneConfig) -> Result<Self, TaskError> {
        let mut builder = reqwest::Client::builder();

        if let Some(path) = &config.callback_ca_path {
            let pem = std::fs::read(path).map_err(|e| {
                TaskError::Config(format!(
                    "failed to read callback CA {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let ca = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| TaskError::Config(format!("invalid callback CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(ca);
        }

        let http = builder
            .build()
            .map_err(|e| TaskError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::new(http))
    }

    /// Override the container that carries the callback and exit status
    pub fn with_task_container_name(mut self, name: impl Into<String>) -> Self {
        self.task_container_name = name.into();
        self
    }

    /// Callback URL from the task container's spec env
    pub fn callback_url(&self, pod: &Pod) -> Option<String> {
        pod.spec
            .as_ref()?
            .containers
            .iter()
            .find(|c| c.name == self.task_container_name)?
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == ENV_COMPLETION_CALLBACK)
            .and_then(|e| e.value.clone())
            .filter(|v| !v.is_empty())
    }

    /// Completion payload for a terminated pod, if its task container finished
    pub fn completion_request(&self, pod: &Pod) -> Option<TaskCompletedRequest> {
        let terminated = pod
            .status
            .as_ref()?
            .container_statuses
            .as_ref()?
            .iter()
            .find(|s| s.name == self.task_container_name)?
            .state
            .as_ref()?
            .terminated
            .as_ref()?;

        let guid = pod.labels().get(LABEL_GUID).cloned().unwrap_or_default();
        Some(TaskCompletedRequest::from_terminated(&guid, terminated))
    }
}

#[async_trait]
impl Reporter for CallbackReporter {
    async fn report(&self, pod: &Pod) -> Result<(), TaskError> {
        let url = self.callback_url(pod).ok_or_else(|| {
            TaskError::Callback(format!(
                "pod {} has no {} in container {}",
                pod.name_any(),
                ENV_COMPLETION_CALLBACK,
                self.task_container_name
            ))
        })?;
        let request = self.completion_request(pod).ok_or_else(|| {
            TaskError::Callback(format!("pod {} has not terminated", pod.name_any()))
        })?;

        debug!(guid = %request.task_guid, url = %url, failed = request.failed, "sending completion callback");

        let response = self.http.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TaskError::Callback(format!(
                "callback to {} returned {}: {}",
                url, status, body
            )));
        }

        info!(guid = %request.task_guid, failed = request.failed, "completion callback delivered");
        Ok(())
    }
}
