//! Task completion reconciler
//!
//! Invoked on every task pod status change. Each invocation re-derives the
//! task's state from the pod rather than tracking a local state machine:
//!
//! ```text
//! running ──terminated──> unreported ──report ok──> reported ──TTL──> deleted
//!                              │                        ▲
//!                              └──report failed (≤ limit)┘ (limit reached: skip)
//! ```
//!
//! The only local state is per-GUID callback bookkeeping (retry count and
//! reported flag), dropped once the Job is deleted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{ContainerStateTerminated, ContainerStatus, Pod};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use tasklane_common::{TasklaneConfig, LABEL_GUID, TASK_CONTAINER_NAME};

use crate::client::{JobsClient, PodReader};
use crate::error::TaskError;
use crate::reporter::Reporter;

/// Delay before a failed reconcile is retried
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Deletes the workload of a task, returning the deleted Job's name
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Deleter: Send + Sync {
    async fn delete(&self, guid: &str) -> Result<String, TaskError>;
}

/// Completion-callback bookkeeping for one GUID
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallbackState {
    /// Failed report attempts so far
    pub retries: u32,
    /// Set once a report succeeded
    pub reported: bool,
}

/// Reconciles task pods to completion
pub struct TaskReconciler {
    pods: Arc<dyn PodReader>,
    jobs: Arc<dyn JobsClient>,
    reporter: Arc<dyn Reporter>,
    deleter: Arc<dyn Deleter>,
    callback_retry_limit: u32,
    ttl: Duration,
    task_container_name: String,
    // Per-key async lock: concurrent reconciles of one GUID run the report
    // transition one at a time.
    state: DashMap<String, Arc<Mutex<CallbackState>>>,
}

impl TaskReconciler {
    pub fn new(
        pods: Arc<dyn PodReader>,
        jobs: Arc<dyn JobsClient>,
        reporter: Arc<dyn Reporter>,
        deleter: Arc<dyn Deleter>,
        callback_retry_limit: u32,
        ttl: Duration,
    ) -> Self {
        Self {
            pods,
            jobs,
            reporter,
            deleter,
            callback_retry_limit,
            ttl,
            task_container_name: TASK_CONTAINER_NAME.to_string(),
            state: DashMap::new(),
        }
    }

    /// Build a reconciler using the retry limit and TTL from the config
    pub fn from_config(
        config: &TasklaneConfig,
        pods: Arc<dyn PodReader>,
        jobs: Arc<dyn JobsClient>,
        reporter: Arc<dyn Reporter>,
        deleter: Arc<dyn Deleter>,
    ) -> Self {
        Self::new(
            pods,
            jobs,
            reporter,
            deleter,
            config.callback_retry_limit,
            config.task_ttl(),
        )
    }

    /// Override the container whose status decides completion
    pub fn with_task_container_name(mut self, name: impl Into<String>) -> Self {
        self.task_container_name = name.into();
        self
    }

    /// Snapshot of the bookkeeping for `guid`, if any is tracked
    pub async fn callback_state(&self, guid: &str) -> Option<CallbackState> {
        let entry = self.state.get(guid).map(|e| e.value().clone())?;
        let state = *entry.lock().await;
        Some(state)
    }

    /// Reconcile the pod `namespace/name`
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action, TaskError> {
        let pod = match self.pods.get(namespace, name).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                debug!(namespace = %namespace, pod = %name, "pod does not exist");
                return Ok(Action::await_change());
            }
            Err(e) => {
                error!(namespace = %namespace, pod = %name, error = %e, "failed to get pod");
                return Err(e);
            }
        };

        if self.terminated_state(&pod).is_none() {
            return Ok(Action::await_change());
        }

        let guid = pod.labels().get(LABEL_GUID).cloned().unwrap_or_default();

        let jobs = self.jobs.get_by_guid(&guid).await.map_err(|e| {
            error!(guid = %guid, pod = %name, error = %e, "failed to get related job by guid");
            e
        })?;
        if jobs.is_empty() {
            debug!(guid = %guid, pod = %name, "no jobs found for this pod");
            // Workload is gone; nothing else would clear its bookkeeping.
            self.state.remove(&guid);
            return Ok(Action::await_change());
        }

        self.report_if_required(&guid, &pod).await?;

        if !self.has_expired(&pod) {
            debug!(guid = %guid, pod = %name, "task has not expired yet");
            return Ok(Action::requeue(self.ttl));
        }

        // Keep the reported flag until the delete succeeds so a retried
        // deletion never reports twice.
        if let Some(entry) = self.state.get(&guid).map(|e| e.value().clone()) {
            entry.lock().await.retries = 0;
        }

        let job = self.deleter.delete(&guid).await.map_err(|e| {
            error!(guid = %guid, error = %e, "failed to delete task job");
            e
        })?;
        self.state.remove(&guid);

        info!(guid = %guid, job = %job, "task expired and job deleted");
        Ok(Action::await_change())
    }

    /// Report once, tolerating up to `callback_retry_limit` failures
    async fn report_if_required(&self, guid: &str, pod: &Pod) -> Result<(), TaskError> {
        let entry = self
            .state
            .entry(guid.to_string())
            .or_default()
            .value()
            .clone();
        let mut state = entry.lock().await;

        if state.reported {
            return Ok(());
        }
        if state.retries >= self.callback_retry_limit {
            debug!(guid = %guid, tries = state.retries, "callback retry limit reached, not reporting");
            return Ok(());
        }

        match self.reporter.report(pod).await {
            Ok(()) => {
                state.reported = true;
                info!(guid = %guid, "task completion reported");
                Ok(())
            }
            Err(e) => {
                state.retries += 1;
                warn!(guid = %guid, tries = state.retries, error = %e, "completion callback failed");
                Err(e)
            }
        }
    }

    fn task_container_status<'a>(&self, pod: &'a Pod) -> Option<&'a ContainerStatus> {
        let status = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| {
                statuses
                    .iter()
                    .find(|s| s.name == self.task_container_name)
            });
        if status.is_none() {
            info!(pod = %pod.name_any(), container = %self.task_container_name, "pod has no task container status");
        }
        status
    }

    fn terminated_state<'a>(&self, pod: &'a Pod) -> Option<&'a ContainerStateTerminated> {
        self.task_container_status(pod)
            .and_then(|s| s.state.as_ref())
            .and_then(|s| s.terminated.as_ref())
    }

    /// Whether the task container finished more than one TTL ago
    fn has_expired(&self, pod: &Pod) -> bool {
        let Some(finished_at) = self
            .terminated_state(pod)
            .and_then(|t| t.finished_at.as_ref())
        else {
            return false;
        };

        let Ok(ttl) = chrono::Duration::from_std(self.ttl) else {
            return false;
        };
        // A TTL past the representable range never expires
        finished_at
            .0
            .checked_add_signed(ttl)
            .is_some_and(|deadline| deadline < Utc::now())
    }
}

/// kube-runtime entry point: reconcile the pod that triggered the event
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<TaskReconciler>) -> Result<Action, TaskError> {
    let namespace = pod.namespace().ok_or(TaskError::MissingNamespace)?;
    ctx.reconcile(&namespace, &pod.name_any()).await
}

/// Error policy for task reconciliation
pub fn error_policy(pod: Arc<Pod>, error: &TaskError, _ctx: Arc<TaskReconciler>) -> Action {
    error!(
        ?error,
        pod = %pod.name_any(),
        "task reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockJobsClient, MockPodReader};
    use crate::reporter::MockReporter;
    use k8s_openapi::api::batch::v1::Job;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateRunning, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    const NAMESPACE: &str = "tasks";
    const POD: &str = "my-task-abcde";
    const GUID: &str = "task-guid";
    const TTL: Duration = Duration::from_secs(60);
    const LIMIT: u32 = 3;

    fn pod_with_state(container: &str, state: Option<ContainerState>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(POD.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                labels: Some(BTreeMap::from([(
                    LABEL_GUID.to_string(),
                    GUID.to_string(),
                )])),
                ..Default::default()
            },
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: container.to_string(),
                    state,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn running_pod() -> Pod {
        pod_with_state(
            TASK_CONTAINER_NAME,
            Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
        )
    }

    /// Pod whose task container finished `age` ago
    fn terminated_pod(age: chrono::Duration) -> Pod {
        pod_with_state(
            TASK_CONTAINER_NAME,
            Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: 0,
                    finished_at: Some(Time(Utc::now() - age)),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        )
    }

    fn fresh_pod() -> Pod {
        terminated_pod(chrono::Duration::zero())
    }

    fn expired_pod() -> Pod {
        terminated_pod(chrono::Duration::seconds(120))
    }

    fn pods_returning(pod: Pod) -> MockPodReader {
        let mut pods = MockPodReader::new();
        pods.expect_get().returning(move |_, _| Ok(pod.clone()));
        pods
    }

    fn jobs_returning(count: usize) -> MockJobsClient {
        let mut jobs = MockJobsClient::new();
        jobs.expect_get_by_guid()
            .returning(move |_| Ok(vec![Job::default(); count]));
        jobs
    }

    fn reconciler(
        pods: MockPodReader,
        jobs: MockJobsClient,
        reporter: MockReporter,
        deleter: MockDeleter,
    ) -> TaskReconciler {
        TaskReconciler::new(
            Arc::new(pods),
            Arc::new(jobs),
            Arc::new(reporter),
            Arc::new(deleter),
            LIMIT,
            TTL,
        )
    }

    fn reporter_ok() -> MockReporter {
        let mut reporter = MockReporter::new();
        reporter.expect_report().returning(|_| Ok(()));
        reporter
    }

    fn reporter_failing() -> MockReporter {
        let mut reporter = MockReporter::new();
        reporter
            .expect_report()
            .returning(|_| Err(TaskError::Callback("boom".to_string())));
        reporter
    }

    // =========================================================================
    // Guards
    // =========================================================================

    #[tokio::test]
    async fn missing_pod_is_already_cleaned_up() {
        let mut pods = MockPodReader::new();
        pods.expect_get().returning(|ns, name| {
            Err(TaskError::NotFound {
                kind: "Pod",
                name: format!("{}/{}", ns, name),
            })
        });
        let mut jobs = MockJobsClient::new();
        jobs.expect_get_by_guid().never();

        let r = reconciler(pods, jobs, MockReporter::new(), MockDeleter::new());
        let action = r.reconcile(NAMESPACE, POD).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn pod_read_failure_propagates() {
        let mut pods = MockPodReader::new();
        pods.expect_get()
            .returning(|_, _| Err(TaskError::Callback("transport down".to_string())));

        let r = reconciler(pods, MockJobsClient::new(), MockReporter::new(), MockDeleter::new());
        assert!(r.reconcile(NAMESPACE, POD).await.is_err());
    }

    #[tokio::test]
    async fn running_task_is_a_noop() {
        let mut reporter = MockReporter::new();
        reporter.expect_report().never();
        let mut jobs = MockJobsClient::new();
        jobs.expect_get_by_guid().never();

        let r = reconciler(pods_returning(running_pod()), jobs, reporter, MockDeleter::new());
        let action = r.reconcile(NAMESPACE, POD).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(r.callback_state(GUID).await, None);
    }

    #[tokio::test]
    async fn pod_without_task_container_status_waits() {
        let pod = pod_with_state("sidecar", None);
        let mut reporter = MockReporter::new();
        reporter.expect_report().never();

        let r = reconciler(
            pods_returning(pod),
            MockJobsClient::new(),
            reporter,
            MockDeleter::new(),
        );
        assert_eq!(
            r.reconcile(NAMESPACE, POD).await.unwrap(),
            Action::await_change()
        );
    }

    #[tokio::test]
    async fn custom_task_container_name_is_honoured() {
        let pod = pod_with_state(
            "task-uploader",
            Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    finished_at: Some(Time(Utc::now())),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        );

        let r = reconciler(pods_returning(pod), jobs_returning(1), reporter_ok(), MockDeleter::new())
            .with_task_container_name("task-uploader");
        assert_eq!(
            r.reconcile(NAMESPACE, POD).await.unwrap(),
            Action::requeue(TTL)
        );
    }

    #[tokio::test]
    async fn no_jobs_for_guid_is_a_noop() {
        let mut reporter = MockReporter::new();
        reporter.expect_report().never();

        let r = reconciler(
            pods_returning(expired_pod()),
            jobs_returning(0),
            reporter,
            MockDeleter::new(),
        );
        assert_eq!(
            r.reconcile(NAMESPACE, POD).await.unwrap(),
            Action::await_change()
        );
    }

    #[tokio::test]
    async fn job_lookup_failure_propagates() {
        let mut jobs = MockJobsClient::new();
        jobs.expect_get_by_guid()
            .withf(|guid| guid == GUID)
            .returning(|_| Err(TaskError::Callback("list failed".to_string())));
        let mut reporter = MockReporter::new();
        reporter.expect_report().never();

        let r = reconciler(pods_returning(fresh_pod()), jobs, reporter, MockDeleter::new());
        assert!(r.reconcile(NAMESPACE, POD).await.is_err());
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    #[tokio::test]
    async fn terminated_task_is_reported_once() {
        let mut reporter = MockReporter::new();
        reporter.expect_report().times(1).returning(|_| Ok(()));

        let r = reconciler(
            pods_returning(fresh_pod()),
            jobs_returning(1),
            reporter,
            MockDeleter::new(),
        );

        for _ in 0..3 {
            assert_eq!(
                r.reconcile(NAMESPACE, POD).await.unwrap(),
                Action::requeue(TTL)
            );
        }
        assert_eq!(
            r.callback_state(GUID).await,
            Some(CallbackState {
                retries: 0,
                reported: true
            })
        );
    }

    #[tokio::test]
    async fn failed_report_increments_retries_and_propagates() {
        let mut deleter = MockDeleter::new();
        deleter.expect_delete().never();

        let r = reconciler(
            pods_returning(expired_pod()),
            jobs_returning(1),
            reporter_failing(),
            deleter,
        );

        let err = r.reconcile(NAMESPACE, POD).await.unwrap_err();
        assert!(matches!(err, TaskError::Callback(_)));
        assert_eq!(
            r.callback_state(GUID).await,
            Some(CallbackState {
                retries: 1,
                reported: false
            })
        );
    }

    #[tokio::test]
    async fn retry_limit_stops_reporting_without_error() {
        let mut reporter = MockReporter::new();
        reporter
            .expect_report()
            .times(LIMIT as usize)
            .returning(|_| Err(TaskError::Callback("boom".to_string())));

        let r = reconciler(
            pods_returning(fresh_pod()),
            jobs_returning(1),
            reporter,
            MockDeleter::new(),
        );

        for attempt in 1..=LIMIT {
            assert!(r.reconcile(NAMESPACE, POD).await.is_err());
            assert_eq!(r.callback_state(GUID).await.unwrap().retries, attempt);
        }

        // Limit reached: no more reports, reconcile proceeds to the TTL check
        for _ in 0..2 {
            assert_eq!(
                r.reconcile(NAMESPACE, POD).await.unwrap(),
                Action::requeue(TTL)
            );
        }
        assert_eq!(r.callback_state(GUID).await.unwrap().retries, LIMIT);
    }

    #[tokio::test]
    async fn exhausted_task_is_still_deleted_on_schedule() {
        let mut reporter = MockReporter::new();
        reporter.expect_report().never();
        let mut deleter = MockDeleter::new();
        deleter
            .expect_delete()
            .times(1)
            .returning(|_| Ok("job-1".to_string()));

        let r = TaskReconciler::new(
            Arc::new(pods_returning(expired_pod())),
            Arc::new(jobs_returning(1)),
            Arc::new(reporter),
            Arc::new(deleter),
            0,
            TTL,
        );

        assert_eq!(
            r.reconcile(NAMESPACE, POD).await.unwrap(),
            Action::await_change()
        );
        assert_eq!(r.callback_state(GUID).await, None);
    }

    // =========================================================================
    // Expiry and deletion
    // =========================================================================

    #[tokio::test]
    async fn unexpired_task_requeues_after_ttl() {
        let mut deleter = MockDeleter::new();
        deleter.expect_delete().never();

        let r = reconciler(pods_returning(fresh_pod()), jobs_returning(1), reporter_ok(), deleter);
        assert_eq!(
            r.reconcile(NAMESPACE, POD).await.unwrap(),
            Action::requeue(TTL)
        );
    }

    #[tokio::test]
    async fn terminated_without_finish_time_waits() {
        let pod = pod_with_state(
            TASK_CONTAINER_NAME,
            Some(ContainerState {
                terminated: Some(ContainerStateTerminated::default()),
                ..Default::default()
            }),
        );
        let mut deleter = MockDeleter::new();
        deleter.expect_delete().never();

        let r = reconciler(pods_returning(pod), jobs_returning(1), reporter_ok(), deleter);
        assert_eq!(
            r.reconcile(NAMESPACE, POD).await.unwrap(),
            Action::requeue(TTL)
        );
    }

    #[tokio::test]
    async fn expired_task_is_deleted_and_forgotten() {
        let mut deleter = MockDeleter::new();
        deleter
            .expect_delete()
            .withf(|guid| guid == GUID)
            .times(1)
            .returning(|_| Ok("job-1".to_string()));

        let r = reconciler(pods_returning(expired_pod()), jobs_returning(1), reporter_ok(), deleter);
        assert_eq!(
            r.reconcile(NAMESPACE, POD).await.unwrap(),
            Action::await_change()
        );
        assert_eq!(r.callback_state(GUID).await, None);
    }

    #[tokio::test]
    async fn failed_delete_propagates_without_reporting_again() {
        let mut reporter = MockReporter::new();
        reporter.expect_report().times(1).returning(|_| Ok(()));
        let mut deleter = MockDeleter::new();
        deleter
            .expect_delete()
            .times(2)
            .returning(|_| Err(TaskError::Callback("delete failed".to_string())));

        let r = reconciler(pods_returning(expired_pod()), jobs_returning(1), reporter, deleter);

        assert!(r.reconcile(NAMESPACE, POD).await.is_err());
        assert!(r.reconcile(NAMESPACE, POD).await.is_err());
        assert_eq!(
            r.callback_state(GUID).await,
            Some(CallbackState {
                retries: 0,
                reported: true
            })
        );
    }

    #[tokio::test]
    async fn retries_reset_before_deletion() {
        let mut reporter = MockReporter::new();
        let mut seq = mockall::Sequence::new();
        reporter
            .expect_report()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(TaskError::Callback("boom".to_string())));
        reporter
            .expect_report()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let mut deleter = MockDeleter::new();
        deleter
            .expect_delete()
            .returning(|_| Err(TaskError::Callback("delete failed".to_string())));

        let r = reconciler(pods_returning(expired_pod()), jobs_returning(1), reporter, deleter);

        assert!(matches!(
            r.reconcile(NAMESPACE, POD).await,
            Err(TaskError::Callback(msg)) if msg == "boom"
        ));
        assert_eq!(r.callback_state(GUID).await.unwrap().retries, 1);

        assert!(r.reconcile(NAMESPACE, POD).await.is_err());
        assert_eq!(
            r.callback_state(GUID).await,
            Some(CallbackState {
                retries: 0,
                reported: true
            })
        );
    }

    #[tokio::test]
    async fn vanished_job_drops_callback_state() {
        let mut jobs = MockJobsClient::new();
        let mut seq = mockall::Sequence::new();
        jobs.expect_get_by_guid()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![Job::default()]));
        jobs.expect_get_by_guid()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![]));
        let mut deleter = MockDeleter::new();
        deleter.expect_delete().never();

        let r = reconciler(pods_returning(fresh_pod()), jobs, reporter_failing(), deleter);

        assert!(r.reconcile(NAMESPACE, POD).await.is_err());
        assert_eq!(r.callback_state(GUID).await.unwrap().retries, 1);

        assert_eq!(
            r.reconcile(NAMESPACE, POD).await.unwrap(),
            Action::await_change()
        );
        assert_eq!(r.callback_state(GUID).await, None);
    }

    #[tokio::test]
    async fn unrepresentable_deadline_never_expires() {
        let ttl = Duration::from_secs(1_000_000_000_000_000);
        let mut deleter = MockDeleter::new();
        deleter.expect_delete().never();

        let r = TaskReconciler::new(
            Arc::new(pods_returning(expired_pod())),
            Arc::new(jobs_returning(1)),
            Arc::new(reporter_ok()),
            Arc::new(deleter),
            LIMIT,
            ttl,
        );
        assert_eq!(
            r.reconcile(NAMESPACE, POD).await.unwrap(),
            Action::requeue(ttl)
        );
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    /// Reporter that takes a while and flags overlapping calls
    struct SlowReporter {
        succeed: bool,
        calls: AtomicU32,
        in_flight: AtomicBool,
        overlapped: AtomicBool,
    }

    impl SlowReporter {
        fn new(succeed: bool) -> Self {
            Self {
                succeed,
                calls: AtomicU32::new(0),
                in_flight: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Reporter for SlowReporter {
        async fn report(&self, _pod: &Pod) -> Result<(), TaskError> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.store(false, Ordering::SeqCst);

            if self.succeed {
                Ok(())
            } else {
                Err(TaskError::Callback("slow failure".to_string()))
            }
        }
    }

    fn concurrent_reconciler(reporter: Arc<SlowReporter>) -> Arc<TaskReconciler> {
        Arc::new(TaskReconciler::new(
            Arc::new(pods_returning(fresh_pod())),
            Arc::new(jobs_returning(1)),
            reporter,
            Arc::new(MockDeleter::new()),
            LIMIT,
            TTL,
        ))
    }

    async fn reconcile_twice_concurrently(r: &Arc<TaskReconciler>) -> Vec<Result<Action, TaskError>> {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let r = r.clone();
                tokio::spawn(async move { r.reconcile(NAMESPACE, POD).await })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_failures_count_every_attempt() {
        let reporter = Arc::new(SlowReporter::new(false));
        let r = concurrent_reconciler(reporter.clone());

        let results = reconcile_twice_concurrently(&r).await;

        assert!(results.iter().all(|res| res.is_err()));
        assert_eq!(reporter.calls.load(Ordering::SeqCst), 2);
        assert!(!reporter.overlapped.load(Ordering::SeqCst));
        assert_eq!(
            r.callback_state(GUID).await,
            Some(CallbackState {
                retries: 2,
                reported: false
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_reconciles_report_once() {
        let reporter = Arc::new(SlowReporter::new(true));
        let r = concurrent_reconciler(reporter.clone());

        let results = reconcile_twice_concurrently(&r).await;

        for result in results {
            assert_eq!(result.unwrap(), Action::requeue(TTL));
        }
        assert_eq!(reporter.calls.load(Ordering::SeqCst), 1);
        assert!(!reporter.overlapped.load(Ordering::SeqCst));
        assert_eq!(
            r.callback_state(GUID).await,
            Some(CallbackState {
                retries: 0,
                reported: true
            })
        );
    }

    // =========================================================================
    // kube-runtime adapters
    // =========================================================================

    #[tokio::test]
    async fn adapter_requires_namespace() {
        let r = Arc::new(reconciler(
            MockPodReader::new(),
            MockJobsClient::new(),
            MockReporter::new(),
            MockDeleter::new(),
        ));
        let mut pod = running_pod();
        pod.metadata.namespace = None;

        let result = reconcile(Arc::new(pod), r).await;
        assert!(matches!(result, Err(TaskError::MissingNamespace)));
    }

    #[tokio::test]
    async fn adapter_reconciles_the_event_pod() {
        let mut pods = MockPodReader::new();
        pods.expect_get()
            .withf(|ns, name| ns == NAMESPACE && name == POD)
            .times(1)
            .returning(|_, _| Ok(running_pod()));

        let r = Arc::new(reconciler(
            pods,
            MockJobsClient::new(),
            MockReporter::new(),
            MockDeleter::new(),
        ));
        let action = reconcile(Arc::new(running_pod()), r).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn error_policy_requeues() {
        let r = Arc::new(reconciler(
            MockPodReader::new(),
            MockJobsClient::new(),
            MockReporter::new(),
            MockDeleter::new(),
        ));
        let action = error_policy(
            Arc::new(running_pod()),
            &TaskError::Callback("boom".to_string()),
            r,
        );
        assert_eq!(action, Action::requeue(ERROR_REQUEUE));
    }
}
