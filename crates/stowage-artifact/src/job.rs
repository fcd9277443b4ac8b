//! Check-size and download Job construction
//!
//! The check-size Job runs the downloader image's `check-size` entrypoint
//! and prints one JSON line with the artifact size. The download Job runs
//! the downloader against the cache PVC, with a `progress-monitor` native
//! sidecar that samples the cache size and prints JSON progress records.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobCondition, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaimVolumeSource,
    PodSecurityContext, PodSpec, PodTemplateSpec, ResourceRequirements, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use stowage_common::crd::{merge_env, Artifact, RuntimeConfigCommon};
use stowage_common::kube_utils::{controller_owner_ref, managed_labels};
use stowage_common::{Error, Result};

use crate::names::{COMPONENT_CHECK_SIZE, COMPONENT_DOWNLOAD};

/// Downloader image used when neither the artifact nor the operator sets one
pub const DEFAULT_DOWNLOAD_IMAGE: &str = "ghcr.io/stowage-dev/artifact-downloader:0.2.0";

/// Image for the progress-monitor sidecar
pub const DEFAULT_MONITOR_IMAGE: &str = "busybox:1.36";

/// Where the cache PVC is mounted in task pods
pub const CACHE_MOUNT_PATH: &str = "/cache";

/// Container printing the discovered size
pub const CHECK_SIZE_CONTAINER: &str = "check-size";
/// Sidecar printing progress records
pub const PROGRESS_MONITOR_CONTAINER: &str = "progress-monitor";
/// Container performing the download
pub const DOWNLOAD_CONTAINER: &str = "model-download";

const CACHE_VOLUME: &str = "cache";
const TMP_VOLUME: &str = "tmp";
const TASK_USER_ID: i64 = 1000;
const DOWNLOAD_BACKOFF_LIMIT: i32 = 2;
const CHECK_SIZE_BACKOFF_LIMIT: i32 = 0;
const TASK_TTL_SECONDS: i32 = 600;

/// Sidecar loop: samples the cache size and prints one JSON record per poll.
///
/// A final `terminated` record is flushed when the kubelet stops the
/// sidecar after the download container exits.
const PROGRESS_MONITOR_SCRIPT: &str = r#"set -u
interval="${POLL_INTERVAL_SECONDS:-5}"
expected="${EXPECTED_SIZE_BYTES:-0}"
current() {
  kb=$(du -sk "$MOUNT_PATH" 2>/dev/null | cut -f1)
  echo $(( ${kb:-0} * 1024 ))
}
emit() {
  printf '{"type":"%s","currentBytes":%s,"expectedBytes":%s}\n' "$1" "$2" "$expected"
}
finish() {
  emit terminated "$(current)"
  exit 0
}
trap finish TERM INT
emit start "$(current)"
while true; do
  now=$(current)
  if [ "$expected" -gt 0 ] && [ "$now" -ge "$expected" ]; then
    emit complete "$now"
  else
    emit progress "$now"
  fi
  sleep "$interval" &
  wait $!
done
"#;

/// Download wrapper: runs the downloader and requires the cache to grow.
///
/// `STOWAGE_DEBUG_FORCE_FAILURE=1` fails the task without downloading.
const DOWNLOAD_SCRIPT: &str = r#"set -eu
umask "${UMASK:-0022}"
bytes() {
  kb=$(du -sk "$MOUNT_PATH" 2>/dev/null | cut -f1)
  echo $(( ${kb:-0} * 1024 ))
}
if [ "${STOWAGE_DEBUG_FORCE_FAILURE:-0}" = "1" ]; then
  echo "forced failure requested via STOWAGE_DEBUG_FORCE_FAILURE" >&2
  exit 1
fi
before=$(bytes)
artifact-downloader "$SOURCE_URI" "$MOUNT_PATH"
after=$(bytes)
grown=$(( after - before ))
min="${MIN_DOWNLOAD_BYTES:-1}"
if [ "$grown" -lt "$min" ]; then
  echo "download wrote ${grown} bytes, expected at least ${min}" >&2
  exit 1
fi
echo "download complete: ${grown} bytes written to ${MOUNT_PATH}"
"#;

/// Images used for task pods
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskImages {
    /// Downloader image (also runs check-size)
    pub download: String,
    /// Progress monitor sidecar image
    pub monitor: String,
}

impl Default for TaskImages {
    fn default() -> Self {
        Self {
            download: DEFAULT_DOWNLOAD_IMAGE.to_string(),
            monitor: DEFAULT_MONITOR_IMAGE.to_string(),
        }
    }
}

impl TaskImages {
    /// Downloader image for `artifact`, honouring its override
    pub fn download_for<'a>(&'a self, artifact: &'a Artifact) -> &'a str {
        artifact
            .spec
            .download_image
            .as_deref()
            .filter(|i| !i.is_empty())
            .unwrap_or(&self.download)
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Env defaults for the download container, lowest precedence
pub fn default_download_env() -> Vec<EnvVar> {
    vec![
        env("HF_XET_CHUNK_CACHE_SIZE_BYTES", "0"),
        env("HF_XET_SHARD_CACHE_SIZE_BYTES", "0"),
        env("HF_XET_HIGH_PERFORMANCE", "1"),
        env("HF_HOME", format!("{CACHE_MOUNT_PATH}/.hf")),
        env("UMASK", "0022"),
    ]
}

fn task_security_context() -> SecurityContext {
    SecurityContext {
        run_as_user: Some(TASK_USER_ID),
        run_as_group: Some(TASK_USER_ID),
        allow_privilege_escalation: Some(false),
        ..Default::default()
    }
}

fn pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_user: Some(TASK_USER_ID),
        run_as_group: Some(TASK_USER_ID),
        fs_group: Some(TASK_USER_ID),
        run_as_non_root: Some(true),
        ..Default::default()
    }
}

fn task_job(
    artifact: &Artifact,
    job_name: &str,
    component: &str,
    backoff_limit: i32,
    pod_spec: PodSpec,
) -> Result<Job> {
    let name = artifact.name_any();
    let owner = controller_owner_ref(artifact)
        .ok_or_else(|| Error::validation_for(&name, "artifact has no UID"))?;
    let labels = managed_labels(&name, component);

    let pull_secrets = &artifact.spec.image_pull_secrets;
    let image_pull_secrets = (!pull_secrets.is_empty()).then(|| pull_secrets.clone());

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name.to_string()),
            namespace: artifact.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(backoff_limit),
            ttl_seconds_after_finished: Some(TASK_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    security_context: Some(pod_security_context()),
                    image_pull_secrets,
                    ..pod_spec
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the size-discovery Job.
///
/// Runs `check-size <sourceUri>`; the last log line of the `check-size`
/// container carries the result.
pub fn build_check_size_job(
    artifact: &Artifact,
    job_name: &str,
    config: &RuntimeConfigCommon,
    images: &TaskImages,
) -> Result<Job> {
    let container = Container {
        name: CHECK_SIZE_CONTAINER.to_string(),
        image: Some(images.download_for(artifact).to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["check-size".to_string()]),
        args: Some(vec![artifact.spec.source_uri.clone()]),
        env: Some(merge_env(&default_download_env(), &config.env)),
        security_context: Some(task_security_context()),
        ..Default::default()
    };

    task_job(
        artifact,
        job_name,
        COMPONENT_CHECK_SIZE,
        CHECK_SIZE_BACKOFF_LIMIT,
        PodSpec {
            containers: vec![container],
            ..Default::default()
        },
    )
}

/// Build the download Job writing into `pvc_name`.
///
/// Env precedence, low to high: built-in defaults, the effective runtime
/// config env (which already includes the artifact's own env), then the
/// fixed `MOUNT_PATH` and `SOURCE_URI`.
pub fn build_download_job(
    artifact: &Artifact,
    job_name: &str,
    pvc_name: &str,
    expected_size_bytes: i64,
    config: &RuntimeConfigCommon,
    images: &TaskImages,
) -> Result<Job> {
    let mut download_env = merge_env(&default_download_env(), &config.env);
    download_env = merge_env(
        &download_env,
        &[
            env("MOUNT_PATH", CACHE_MOUNT_PATH),
            env("SOURCE_URI", artifact.spec.source_uri.clone()),
        ],
    );

    let monitor = Container {
        name: PROGRESS_MONITOR_CONTAINER.to_string(),
        image: Some(images.monitor.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        // restartPolicy Always on an init container makes it a native sidecar
        restart_policy: Some("Always".to_string()),
        env: Some(vec![
            env("EXPECTED_SIZE_BYTES", expected_size_bytes.to_string()),
            env("MOUNT_PATH", CACHE_MOUNT_PATH),
        ]),
        command: Some(vec!["/bin/sh".to_string()]),
        args: Some(vec!["-c".to_string(), PROGRESS_MONITOR_SCRIPT.to_string()]),
        volume_mounts: Some(vec![VolumeMount {
            name: CACHE_VOLUME.to_string(),
            mount_path: CACHE_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("10m".to_string())),
                ("memory".to_string(), Quantity("16Mi".to_string())),
            ])),
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("50m".to_string())),
                ("memory".to_string(), Quantity("32Mi".to_string())),
            ])),
            ..Default::default()
        }),
        security_context: Some(task_security_context()),
        ..Default::default()
    };

    let download = Container {
        name: DOWNLOAD_CONTAINER.to_string(),
        image: Some(images.download_for(artifact).to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(download_env),
        command: Some(vec!["/bin/sh".to_string()]),
        args: Some(vec!["-c".to_string(), DOWNLOAD_SCRIPT.to_string()]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: CACHE_VOLUME.to_string(),
                mount_path: CACHE_MOUNT_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: TMP_VOLUME.to_string(),
                mount_path: "/tmp".to_string(),
                ..Default::default()
            },
        ]),
        security_context: Some(task_security_context()),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: CACHE_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name.to_string(),
                read_only: Some(false),
            }),
            ..Default::default()
        },
        Volume {
            name: TMP_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                size_limit: Some(Quantity("500Mi".to_string())),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    task_job(
        artifact,
        job_name,
        COMPONENT_DOWNLOAD,
        DOWNLOAD_BACKOFF_LIMIT,
        PodSpec {
            init_containers: Some(vec![monitor]),
            containers: vec![download],
            volumes: Some(volumes),
            ..Default::default()
        },
    )
}

// =============================================================================
// Job status helpers
// =============================================================================

fn job_condition<'a>(job: &'a Job, type_: &str) -> Option<&'a JobCondition> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == type_ && c.status == "True")
        })
}

/// Check if a Job has completed successfully
pub fn is_job_complete(job: &Job) -> bool {
    job_condition(job, "Complete").is_some()
        || job
            .status
            .as_ref()
            .and_then(|s| s.succeeded)
            .is_some_and(|n| n > 0)
}

/// Check if a Job has failed
pub fn is_job_failed(job: &Job) -> bool {
    job_condition(job, "Failed").is_some()
}

/// Extract failure message from a failed Job
pub fn job_failure_message(job: &Job) -> Option<String> {
    job_condition(job, "Failed").and_then(|c| c.message.clone())
}

/// Extract the machine-readable failure reason (e.g. `BackoffLimitExceeded`)
pub fn job_failure_reason(job: &Job) -> Option<&str> {
    job_condition(job, "Failed").and_then(|c| c.reason.as_deref())
}
