//! Kubernetes-facing capabilities used by the desirer and reconciler
//!
//! Each capability is a trait so the task logic can be exercised against
//! mocks; the `Kube*` types are the production implementations.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use tasklane_common::LABEL_GUID;

use crate::error::TaskError;

/// Create, list and delete Jobs in a single namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Create a Job; a name collision surfaces as `TaskError::Conflict`
    async fn create(&self, job: &Job) -> Result<Job, TaskError>;

    /// List Jobs matching a `key=value` label selector
    async fn list(&self, label_selector: &str) -> Result<Vec<Job>, TaskError>;

    /// Delete a Job and its pods by name
    async fn delete(&self, name: &str) -> Result<(), TaskError>;
}

/// Narrow view of Jobs used by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobsClient: Send + Sync {
    /// Jobs labelled with the given task GUID
    async fn get_by_guid(&self, guid: &str) -> Result<Vec<Job>, TaskError>;
}

/// Read pods by namespaced name
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodReader: Send + Sync {
    /// Fetch a pod; a missing pod is `TaskError::NotFound`
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, TaskError>;
}

/// `JobClient` backed by the Kubernetes API
pub struct KubeJobClient {
    api: Api<Job>,
}

impl KubeJobClient {
    /// Create a client for Jobs in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl JobClient for KubeJobClient {
    async fn create(&self, job: &Job) -> Result<Job, TaskError> {
        match self.api.create(&PostParams::default(), job).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(TaskError::Conflict(ae.message)),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<Job>, TaskError> {
        let jobs = self
            .api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        debug!(selector = %label_selector, count = jobs.items.len(), "listed jobs");
        Ok(jobs.items)
    }

    async fn delete(&self, name: &str) -> Result<(), TaskError> {
        // Background propagation so the Job's pods go with it
        self.api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }
}

#[async_trait]
impl JobsClient for KubeJobClient {
    async fn get_by_guid(&self, guid: &str) -> Result<Vec<Job>, TaskError> {
        self.list(&format!("{}={}", LABEL_GUID, guid)).await
    }
}

/// `PodReader` backed by the Kubernetes API
pub struct KubePodReader {
    client: Client,
}

impl KubePodReader {
    /// Create a pod reader using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodReader for KubePodReader {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, TaskError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(pod) => Ok(pod),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(TaskError::NotFound {
                kind: "Pod",
                name: format!("{}/{}", namespace, name),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
