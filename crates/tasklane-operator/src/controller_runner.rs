//! Controller runner - builds the task completion controller future

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use tasklane_common::{TasklaneConfig, LABEL_GUID, LABEL_SOURCE_TYPE, SOURCE_TYPE_TASK};
use tasklane_task::client::{KubeJobClient, KubePodReader};
use tasklane_task::reconciler::{error_policy, reconcile};
use tasklane_task::{CallbackReporter, TaskJobDeleter, TaskReconciler};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Label selector matching task pods
pub fn task_pod_selector() -> String {
    format!("{}={},{}", LABEL_SOURCE_TYPE, SOURCE_TYPE_TASK, LABEL_GUID)
}

/// Assemble the reconciler from Kubernetes-backed collaborators
pub fn build_task_reconciler(
    client: Client,
    config: &TasklaneConfig,
) -> anyhow::Result<TaskReconciler> {
    let jobs = Arc::new(KubeJobClient::new(client.clone(), &config.namespace));
    let pods = Arc::new(KubePodReader::new(client));
    let reporter = Arc::new(CallbackReporter::from_config(config)?);
    let deleter = Arc::new(TaskJobDeleter::new(jobs.clone()));

    Ok(TaskReconciler::from_config(
        config, pods, jobs, reporter, deleter,
    ))
}

/// Build the task completion controller future
pub fn build_task_controller(
    client: Client,
    config: &TasklaneConfig,
) -> anyhow::Result<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let ctx = Arc::new(build_task_reconciler(client.clone(), config)?);
    let pods: Api<Pod> = Api::namespaced(client, &config.namespace);

    tracing::info!(namespace = %config.namespace, "- Task controller");

    Ok(Box::pin(
        Controller::new(
            pods,
            WatcherConfig::default()
                .labels(&task_pod_selector())
                .timeout(WATCH_TIMEOUT_SECS),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Task")),
    ))
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
