//! Task desirer: compiles tasks into Kubernetes Jobs
//!
//! Plain tasks become a single-container Job. Staging tasks become a
//! three-stage pipeline in one pod:
//! - init container `task-downloader` fetches the app bits and buildpacks
//! - init container `task-executor` runs the build with the task's resources
//! - container `task-uploader` uploads the result
//!
//! Both variants share naming, labels, annotations and the security posture
//! through [`TaskDesirer::job_for`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, KeyToPath, LocalObjectReference,
    ObjectFieldSelector, PodSecurityContext, PodSpec, PodTemplateSpec, ProjectedVolumeSource,
    ResourceRequirements, SecretProjection, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use tasklane_common::config::StagingTlsConfig;
use tasklane_common::{
    TasklaneConfig, ANNOTATION_APP_ID, ANNOTATION_APP_NAME, ANNOTATION_ORG_GUID,
    ANNOTATION_ORG_NAME, ANNOTATION_SPACE_GUID, ANNOTATION_SPACE_NAME, DOWNLOADER_CONTAINER_NAME,
    ENV_APP_ID, ENV_CF_INSTANCE_ADDR, ENV_CF_INSTANCE_INTERNAL_IP, ENV_CF_INSTANCE_IP,
    ENV_CF_INSTANCE_PORT, ENV_CF_INSTANCE_PORTS, ENV_POD_NAME, EXECUTOR_CONTAINER_NAME,
    LABEL_APP_GUID, LABEL_GUID, LABEL_SOURCE_TYPE, LABEL_STAGING_GUID, SOURCE_TYPE_STAGING,
    SOURCE_TYPE_TASK, TASK_CONTAINER_NAME, UPLOADER_CONTAINER_NAME,
};

use crate::client::JobClient;
use crate::error::TaskError;
use crate::reconciler::Deleter;
use crate::task::{StagingTask, Task};

/// Hard ceiling after which Kubernetes fails the Job regardless of the reconciler
pub const ACTIVE_DEADLINE_SECONDS: i64 = 900;

/// UID every task container runs as
pub const TASK_RUN_AS_USER: i64 = 2000;

/// Projected volume holding all staging certificates
pub const CERTS_VOLUME_NAME: &str = "tasklane-certs";
/// Mount path of the certs volume
pub const CERTS_MOUNT_PATH: &str = "/etc/config/certs";

/// Build output volume
pub const RECIPE_OUTPUT_NAME: &str = "recipe-output";
/// Mount path of the build output volume
pub const RECIPE_OUTPUT_LOCATION: &str = "/out";

/// Buildpacks volume
pub const RECIPE_BUILDPACKS_NAME: &str = "recipe-buildpacks";
/// Mount path of the buildpacks volume
pub const RECIPE_BUILDPACKS_DIR: &str = "/var/lib/buildpacks";

/// Workspace volume holding the app bits
pub const RECIPE_WORKSPACE_NAME: &str = "recipe-workspace";
/// Mount path of the workspace volume
pub const RECIPE_WORKSPACE_DIR: &str = "/workspace";

/// Buildpack cache volume
pub const BUILDPACK_CACHE_NAME: &str = "buildpack-cache";
/// Mount path of the buildpack cache volume
pub const BUILDPACK_CACHE_DIR: &str = "/tmp/cache";

/// Desires tasks as Jobs and deletes them by GUID
pub struct TaskDesirer {
    namespace: String,
    tls_config: Vec<StagingTlsConfig>,
    service_account_name: String,
    registry_secret_name: String,
    jobs: Arc<dyn JobClient>,
}

impl TaskDesirer {
    pub fn new(
        namespace: impl Into<String>,
        tls_config: Vec<StagingTlsConfig>,
        service_account_name: impl Into<String>,
        registry_secret_name: impl Into<String>,
        jobs: Arc<dyn JobClient>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            tls_config,
            service_account_name: service_account_name.into(),
            registry_secret_name: registry_secret_name.into(),
            jobs,
        }
    }

    /// Build a desirer from the operator configuration
    pub fn from_config(config: &TasklaneConfig, jobs: Arc<dyn JobClient>) -> Self {
        Self::new(
            config.namespace.clone(),
            config.staging_tls.clone(),
            config.staging_service_account_name.clone(),
            config.registry_secret_name.clone(),
            jobs,
        )
    }

    /// Create the Job for a plain task
    ///
    /// The create error is returned unchanged; an existing Job is not retried.
    pub async fn desire(&self, task: &Task) -> Result<(), TaskError> {
        let job = self.compile_task(task);
        info!(guid = %task.guid, prefix = %task.name_prefix(), "desiring task");
        self.jobs.create(&job).await?;
        Ok(())
    }

    /// Create the Job for a staging task
    pub async fn desire_staging(&self, staging: &StagingTask) -> Result<(), TaskError> {
        let job = self.compile_staging(staging);
        info!(guid = %staging.task.guid, prefix = %staging.task.name_prefix(), "desiring staging task");
        self.jobs.create(&job).await?;
        Ok(())
    }

    /// Delete the single staging Job labelled with `guid`, returning its name
    ///
    /// Zero or several matches are refused rather than partially deleted.
    pub async fn delete(&self, guid: &str) -> Result<String, TaskError> {
        delete_single(self.jobs.as_ref(), LABEL_STAGING_GUID, guid).await
    }

    /// Compile a plain task into a Job without creating it
    pub fn compile_task(&self, task: &Task) -> Job {
        let container = Container {
            name: TASK_CONTAINER_NAME.to_string(),
            image: Some(task.image.clone()),
            image_pull_policy: Some("Always".to_string()),
            command: (!task.command.is_empty()).then(|| task.command.clone()),
            env: Some(task_env(task)),
            ..Default::default()
        };

        let pod_spec = PodSpec {
            containers: vec![container],
            ..Default::default()
        };

        let mut labels = task_labels(task);
        labels.insert(LABEL_SOURCE_TYPE.to_string(), SOURCE_TYPE_TASK.to_string());

        self.job_for(task, labels, pod_spec)
    }

    /// Compile a staging task into a Job without creating it
    pub fn compile_staging(&self, staging: &StagingTask) -> Job {
        let task = &staging.task;
        let env = task_env(task);

        let certs = mount(CERTS_VOLUME_NAME, CERTS_MOUNT_PATH, true);
        let output = mount(RECIPE_OUTPUT_NAME, RECIPE_OUTPUT_LOCATION, false);
        let buildpacks = mount(RECIPE_BUILDPACKS_NAME, RECIPE_BUILDPACKS_DIR, false);
        let workspace = mount(RECIPE_WORKSPACE_NAME, RECIPE_WORKSPACE_DIR, false);
        let cache = mount(BUILDPACK_CACHE_NAME, BUILDPACK_CACHE_DIR, false);

        let downloader = stage_container(
            DOWNLOADER_CONTAINER_NAME,
            staging.downloader_image(),
            &env,
            vec![
                buildpacks.clone(),
                certs.clone(),
                workspace.clone(),
                cache.clone(),
            ],
        );

        let mut executor = stage_container(
            EXECUTOR_CONTAINER_NAME,
            staging.executor_image(),
            &env,
            vec![
                buildpacks,
                certs.clone(),
                workspace,
                output.clone(),
                cache.clone(),
            ],
        );
        executor.resources = Some(executor_resources(task));

        let uploader = stage_container(
            UPLOADER_CONTAINER_NAME,
            staging.uploader_image(),
            &env,
            vec![certs, output, cache],
        );

        let pod_spec = PodSpec {
            init_containers: Some(vec![downloader, executor]),
            containers: vec![uploader],
            volumes: Some(self.staging_volumes()),
            ..Default::default()
        };

        let mut labels = task_labels(task);
        labels.insert(
            LABEL_SOURCE_TYPE.to_string(),
            SOURCE_TYPE_STAGING.to_string(),
        );
        labels.insert(LABEL_STAGING_GUID.to_string(), task.guid.clone());

        self.job_for(task, labels, pod_spec)
    }

    /// Wrap a pod spec in a Job with the shared metadata and security posture
    fn job_for(&self, task: &Task, labels: BTreeMap<String, String>, mut pod_spec: PodSpec) -> Job {
        let annotations = task_annotations(task);

        pod_spec.restart_policy = Some("Never".to_string());
        pod_spec.automount_service_account_token = Some(false);
        pod_spec.service_account_name = Some(self.service_account_name.clone());
        pod_spec.image_pull_secrets = Some(vec![LocalObjectReference {
            name: self.registry_secret_name.clone(),
        }]);
        pod_spec.security_context = Some(PodSecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(TASK_RUN_AS_USER),
            ..Default::default()
        });

        Job {
            metadata: ObjectMeta {
                generate_name: Some(task.name_prefix()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                annotations: Some(annotations.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                active_deadline_seconds: Some(ACTIVE_DEADLINE_SECONDS),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Certs projection plus the four node-local working directories
    fn staging_volumes(&self) -> Vec<Volume> {
        let sources = self
            .tls_config
            .iter()
            .map(|tls| VolumeProjection {
                secret: Some(SecretProjection {
                    name: tls.secret_name.clone(),
                    items: Some(
                        tls.key_paths
                            .iter()
                            .map(|kp| KeyToPath {
                                key: kp.key.clone(),
                                path: kp.path.clone(),
                                mode: None,
                            })
                            .collect(),
                    ),
                    optional: None,
                }),
                ..Default::default()
            })
            .collect();

        debug!(secrets = self.tls_config.len(), "projecting staging certificates");

        let mut volumes = vec![Volume {
            name: CERTS_VOLUME_NAME.to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(sources),
                default_mode: None,
            }),
            ..Default::default()
        }];

        for name in [
            RECIPE_OUTPUT_NAME,
            RECIPE_BUILDPACKS_NAME,
            RECIPE_WORKSPACE_NAME,
            BUILDPACK_CACHE_NAME,
        ] {
            volumes.push(Volume {
                name: name.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }

        volumes
    }
}

/// `Deleter` for the Jobs the reconciler follows
///
/// Matches on `LABEL_GUID`, the label task pods inherit from their Job
/// template, so the GUID read from a pod always finds its owning Job.
pub struct TaskJobDeleter {
    jobs: Arc<dyn JobClient>,
}

impl TaskJobDeleter {
    pub fn new(jobs: Arc<dyn JobClient>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Deleter for TaskJobDeleter {
    async fn delete(&self, guid: &str) -> Result<String, TaskError> {
        delete_single(self.jobs.as_ref(), LABEL_GUID, guid).await
    }
}

/// Delete the only Job with `label=guid`, refusing zero or several matches
async fn delete_single(jobs: &dyn JobClient, label: &str, guid: &str) -> Result<String, TaskError> {
    let selector = format!("{}={}", label, guid);
    let matched = jobs.list(&selector).await?;

    if matched.len() != 1 {
        warn!(guid = %guid, selector = %selector, count = matched.len(), "refusing to delete: expected exactly one job");
        return Err(TaskError::Cardinality {
            guid: guid.to_string(),
            count: matched.len(),
        });
    }

    let name = matched[0].metadata.name.clone().unwrap_or_default();
    jobs.delete(&name).await?;
    info!(guid = %guid, job = %name, "deleted job");
    Ok(name)
}

fn task_labels(task: &Task) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP_GUID.to_string(), task.app_guid.clone()),
        (
            LABEL_GUID.to_string(),
            task.env.get(ENV_APP_ID).cloned().unwrap_or_default(),
        ),
    ])
}

fn task_annotations(task: &Task) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ANNOTATION_APP_NAME.to_string(), task.app_name.clone()),
        (ANNOTATION_APP_ID.to_string(), task.app_guid.clone()),
        (ANNOTATION_ORG_NAME.to_string(), task.org_name.clone()),
        (ANNOTATION_ORG_GUID.to_string(), task.org_guid.clone()),
        (ANNOTATION_SPACE_NAME.to_string(), task.space_name.clone()),
        (ANNOTATION_SPACE_GUID.to_string(), task.space_guid.clone()),
    ])
}

/// Task env in key order, followed by the instance entries every task gets
fn task_env(task: &Task) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = task
        .env
        .iter()
        .map(|(name, value)| literal_env(name, value))
        .collect();

    env.push(field_env(ENV_POD_NAME, "metadata.name"));
    env.push(field_env(ENV_CF_INSTANCE_IP, "status.podIP"));
    env.push(field_env(ENV_CF_INSTANCE_INTERNAL_IP, "status.podIP"));
    env.push(literal_env(ENV_CF_INSTANCE_ADDR, ""));
    env.push(literal_env(ENV_CF_INSTANCE_PORT, ""));
    env.push(literal_env(ENV_CF_INSTANCE_PORTS, "[]"));
    env
}

fn literal_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

fn stage_container(name: &str, image: &str, env: &[EnvVar], mounts: Vec<VolumeMount>) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("Always".to_string()),
        env: Some(env.to_vec()),
        volume_mounts: Some(mounts),
        ..Default::default()
    }
}

/// CPU in millicores (weight × 10), memory and disk in megabytes
fn executor_resources(task: &Task) -> ResourceRequirements {
    let cpu_millis = u32::from(task.cpu_weight) * 10;
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(format!("{}m", cpu_millis))),
            ("memory".to_string(), Quantity(format!("{}M", task.memory_mb))),
            (
                "ephemeral-storage".to_string(),
                Quantity(format!("{}M", task.disk_mb)),
            ),
        ])),
        ..Default::default()
    }
}
