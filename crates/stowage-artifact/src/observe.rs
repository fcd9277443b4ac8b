//! Observe phase: typed state derived from raw fetch results
//!
//! Parses the check-size and progress output and classifies every task
//! and the PVC. Nothing here talks to the API server.

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use tracing::warn;

use stowage_common::crd::{Artifact, FailureDetail};

use crate::failure::{categorize_failure, is_pod_failed};
use crate::fetch::{ArtifactFetch, FetchResult};
use crate::job::{is_job_complete, is_job_failed};
use crate::progress::{parse_progress_line, parse_size_output, Progress, SizeOutputError};
use crate::pvc::{is_wait_for_first_consumer, pvc_phase, PHASE_BOUND, PHASE_LOST, PHASE_PENDING};

/// Lifecycle of a check-size or download Job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// No Job exists (or it was not looked up)
    Absent,
    /// The Job exists and has not finished
    Running,
    /// The Job completed
    Succeeded,
    /// The Job or one of its pods failed
    Failed,
}

/// Lifecycle of the cache PVC
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageState {
    /// Not created yet
    Absent,
    /// Waiting for a volume
    Pending {
        /// Binding is deferred until a pod uses the claim
        wait_for_first_consumer: bool,
    },
    /// Bound to a volume
    Bound,
    /// The bound volume is gone
    Lost,
    /// A phase the engine does not know, or no phase yet
    Unknown(Option<String>),
}

/// Where the effective size comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeSource {
    /// `spec.size`
    Declared(i64),
    /// A check-size run, this reconcile or an earlier one
    Discovered(i64),
}

impl SizeSource {
    /// Size in bytes
    pub fn bytes(&self) -> i64 {
        match self {
            Self::Declared(b) | Self::Discovered(b) => *b,
        }
    }
}

/// Everything the plan and project phases need
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    /// Effective size, if known
    pub size: Option<SizeSource>,
    /// Size parsed from check-size output in this reconcile
    pub newly_discovered_size: Option<i64>,
    /// Why a finished check-size run produced no usable size
    pub size_output_error: Option<SizeOutputError>,
    /// Size-discovery Job
    pub check_size: TaskState,
    /// Whether the check-size Job was looked up at all
    pub check_size_fetched: bool,
    /// Cache PVC
    pub storage: StorageState,
    /// The cache PVC when it exists
    pub pvc: Option<PersistentVolumeClaim>,
    /// Download Job
    pub download: TaskState,
    /// A download success was recorded by an earlier reconcile
    pub completed_at: Option<DateTime<Utc>>,
    /// Progress from the monitor sidecar, if any
    pub progress: Option<Progress>,
    /// Categorized failure of whichever task failed
    pub failure_detail: Option<FailureDetail>,
}

impl Observation {
    /// True when the size is declared or discovered
    pub fn size_known(&self) -> bool {
        self.size.is_some()
    }

    /// Effective size in bytes
    pub fn effective_size(&self) -> Option<i64> {
        self.size.map(|s| s.bytes())
    }

    /// The PVC is bound
    pub fn storage_ready(&self) -> bool {
        self.storage == StorageState::Bound
    }

    /// The PVC lost its volume
    pub fn storage_lost(&self) -> bool {
        self.storage == StorageState::Lost
    }

    /// The PVC waits for a first consumer, so a download Job may be created
    pub fn storage_pending_wait_for_first_consumer(&self) -> bool {
        matches!(
            self.storage,
            StorageState::Pending {
                wait_for_first_consumer: true
            }
        )
    }

    /// The download Job completed, or completed earlier and was cleaned up
    pub fn download_succeeded(&self) -> bool {
        match self.download {
            TaskState::Succeeded => true,
            TaskState::Absent => self.completed_at.is_some(),
            TaskState::Running | TaskState::Failed => false,
        }
    }

    /// The download Job or one of its pods failed
    pub fn download_failed(&self) -> bool {
        self.download == TaskState::Failed
    }

    /// The download Job exists and has not finished
    pub fn download_pending_or_running(&self) -> bool {
        self.download == TaskState::Running
    }

    /// No download Job exists
    pub fn download_absent(&self) -> bool {
        self.download == TaskState::Absent
    }

    /// Size discovery failed while the size is still unknown
    pub fn size_discovery_failed(&self) -> bool {
        !self.size_known() && self.check_size == TaskState::Failed
    }
}

fn task_state(job: &FetchResult<Job>, pods: Option<&FetchResult<Vec<Pod>>>) -> TaskState {
    match job.value() {
        None => TaskState::Absent,
        Some(job) if is_job_complete(job) => TaskState::Succeeded,
        Some(job) if is_job_failed(job) => TaskState::Failed,
        Some(_) => {
            // pod failure shows up before the Job controller marks the Job
            let pod_failed = pods.is_some_and(|p| p.items().iter().any(is_pod_failed));
            if pod_failed {
                TaskState::Failed
            } else {
                TaskState::Running
            }
        }
    }
}

fn storage_state(fetched: &ArtifactFetch) -> StorageState {
    let Some(pvc) = fetched.pvc.value() else {
        return StorageState::Absent;
    };
    match pvc_phase(pvc) {
        Some(PHASE_BOUND) => StorageState::Bound,
        Some(PHASE_LOST) => StorageState::Lost,
        Some(PHASE_PENDING) => StorageState::Pending {
            wait_for_first_consumer: fetched
                .storage_class
                .as_ref()
                .and_then(FetchResult::value)
                .is_some_and(is_wait_for_first_consumer),
        },
        other => StorageState::Unknown(other.map(str::to_string)),
    }
}

/// Derive the observation for `artifact` from `fetched`
pub fn observe(artifact: &Artifact, fetched: &ArtifactFetch) -> Observation {
    let name = artifact.name_any();
    let status = artifact.status.as_ref();

    let check_size = fetched
        .check_size_job
        .as_ref()
        .map(|job| task_state(job, fetched.check_size_pods.as_ref()))
        .unwrap_or(TaskState::Absent);

    let mut newly_discovered_size = None;
    let mut size_output_error = None;
    if check_size == TaskState::Succeeded {
        match parse_size_output(&fetched.check_size_output) {
            Ok(size) => newly_discovered_size = Some(size),
            Err(e) => {
                warn!(
                    artifact = %name,
                    output = %fetched.check_size_output,
                    error = %e,
                    "failed to parse check-size output"
                );
                size_output_error = Some(e);
            }
        }
    }

    let declared = artifact.spec.declared_size_bytes().ok().flatten();
    let size = declared
        .map(SizeSource::Declared)
        .or_else(|| {
            status
                .and_then(|s| s.discovered_size_bytes)
                .map(SizeSource::Discovered)
        })
        .or_else(|| newly_discovered_size.map(SizeSource::Discovered));

    let download = task_state(&fetched.download_job, fetched.download_pods.as_ref());

    let failure_detail = if download == TaskState::Failed {
        let pod = fetched
            .download_pods
            .as_ref()
            .and_then(|p| p.items().iter().find(|pod| is_pod_failed(pod)));
        Some(categorize_failure(
            fetched.download_job.value(),
            pod,
            &fetched.failure_log,
        ))
    } else if size.is_none() && check_size == TaskState::Failed {
        let pod = fetched
            .check_size_pods
            .as_ref()
            .and_then(|p| p.items().iter().find(|pod| is_pod_failed(pod)));
        Some(categorize_failure(
            fetched.check_size_job.as_ref().and_then(FetchResult::value),
            pod,
            &fetched.failure_log,
        ))
    } else {
        None
    };

    Observation {
        size,
        newly_discovered_size,
        size_output_error,
        check_size,
        check_size_fetched: fetched.check_size_job.is_some(),
        storage: storage_state(fetched),
        pvc: fetched.pvc.value().cloned(),
        download,
        completed_at: status.and_then(|s| s.completed_at),
        progress: parse_progress_line(&fetched.progress_line),
        failure_detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PodStatus,
    };
    use k8s_openapi::api::storage::v1::StorageClass;
    use stowage_common::crd::{ArtifactSpec, ArtifactStatus, FailureCategory};

    fn artifact(size: Option<&str>) -> Artifact {
        let mut a = Artifact::new(
            "llama",
            ArtifactSpec {
                source_uri: "hf://org/llama".to_string(),
                size: size.map(str::to_string),
                ..Default::default()
            },
        );
        a.metadata.namespace = Some("models".to_string());
        a.metadata.uid = Some("uid-1".to_string());
        a
    }

    fn empty_fetch() -> ArtifactFetch {
        ArtifactFetch {
            pvc: FetchResult::Absent,
            storage_class: None,
            check_size_job: None,
            check_size_pods: None,
            check_size_output: String::new(),
            download_job: FetchResult::Absent,
            download_pods: None,
            progress_line: String::new(),
            failure_log: String::new(),
        }
    }

    fn pvc(phase: &str, class: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: class.map(str::to_string),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn job(condition: Option<&str>) -> Job {
        Job {
            status: condition.map(|type_| JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn declared_size_wins() {
        let obs = observe(&artifact(Some("1Ki")), &empty_fetch());
        assert_eq!(obs.size, Some(SizeSource::Declared(1024)));
        assert_eq!(obs.storage, StorageState::Absent);
        assert_eq!(obs.download, TaskState::Absent);
        assert!(!obs.check_size_fetched);
    }

    #[test]
    fn discovered_size_is_parsed_from_finished_check_size_job() {
        let mut fetched = empty_fetch();
        fetched.check_size_job = Some(FetchResult::Found(job(Some("Complete"))));
        fetched.check_size_output = r#"{"url":"hf://org/llama","sizeBytes":2048}"#.to_string();
        let obs = observe(&artifact(None), &fetched);
        assert_eq!(obs.newly_discovered_size, Some(2048));
        assert_eq!(obs.size, Some(SizeSource::Discovered(2048)));
    }

    #[test]
    fn invalid_size_output_keeps_size_unknown() {
        let mut fetched = empty_fetch();
        fetched.check_size_job = Some(FetchResult::Found(job(Some("Complete"))));
        fetched.check_size_output = r#"{"url":"hf://org/llama","sizeBytes":0}"#.to_string();
        let obs = observe(&artifact(None), &fetched);
        assert!(!obs.size_known());
        assert_eq!(obs.size_output_error, Some(SizeOutputError::OutOfRange(0)));
        assert!(!obs.size_discovery_failed());

        let carried = obs.clone();
        assert_eq!(carried.size_output_error, obs.size_output_error);
    }

    #[test]
    fn status_discovered_size_is_reused() {
        let mut a = artifact(None);
        a.status = Some(ArtifactStatus {
            discovered_size_bytes: Some(4096),
            ..Default::default()
        });
        let obs = observe(&a, &empty_fetch());
        assert_eq!(obs.effective_size(), Some(4096));
    }

    #[test]
    fn failed_pod_marks_running_download_failed() {
        let mut fetched = empty_fetch();
        fetched.download_job = FetchResult::Found(job(None));
        fetched.download_pods = Some(FetchResult::Found(vec![pod("Failed")]));
        fetched.failure_log = "OSError: [Errno 28] No space left on device".to_string();
        let obs = observe(&artifact(Some("1Gi")), &fetched);
        assert!(obs.download_failed());
        assert!(!obs.download_pending_or_running());
        let detail = obs.failure_detail.unwrap();
        assert_eq!(detail.category, FailureCategory::StorageFull);
    }

    #[test]
    fn running_download_parses_progress() {
        let mut fetched = empty_fetch();
        fetched.download_job = FetchResult::Found(job(None));
        fetched.download_pods = Some(FetchResult::Found(vec![pod("Running")]));
        fetched.progress_line =
            r#"{"type":"progress","currentBytes":50,"expectedBytes":200}"#.to_string();
        let obs = observe(&artifact(Some("1Gi")), &fetched);
        assert!(obs.download_pending_or_running());
        assert_eq!(obs.progress.map(|p| p.percentage), Some(25));
        assert!(obs.failure_detail.is_none());
    }

    #[test]
    fn vanished_job_after_completion_still_counts_as_success() {
        let mut a = artifact(Some("1Gi"));
        a.status = Some(ArtifactStatus {
            completed_at: Some(Utc::now()),
            ..Default::default()
        });
        let obs = observe(&a, &empty_fetch());
        assert!(obs.download_absent());
        assert!(obs.download_succeeded());
    }

    #[test]
    fn pvc_phases_map_to_storage_state() {
        let mut fetched = empty_fetch();
        fetched.pvc = FetchResult::Found(pvc("Bound", None));
        assert!(observe(&artifact(Some("1Gi")), &fetched).storage_ready());

        fetched.pvc = FetchResult::Found(pvc("Lost", None));
        assert!(observe(&artifact(Some("1Gi")), &fetched).storage_lost());

        fetched.pvc = FetchResult::Found(pvc("Pending", Some("local-path")));
        fetched.storage_class = Some(FetchResult::Found(StorageClass {
            volume_binding_mode: Some("WaitForFirstConsumer".to_string()),
            ..Default::default()
        }));
        let obs = observe(&artifact(Some("1Gi")), &fetched);
        assert!(obs.storage_pending_wait_for_first_consumer());
        assert!(obs.pvc.is_some());

        fetched.storage_class = None;
        let obs = observe(&artifact(Some("1Gi")), &fetched);
        assert_eq!(
            obs.storage,
            StorageState::Pending {
                wait_for_first_consumer: false
            }
        );
    }

    #[test]
    fn failed_check_size_job_is_a_discovery_failure() {
        let mut fetched = empty_fetch();
        fetched.check_size_job = Some(FetchResult::Found(job(Some("Failed"))));
        fetched.failure_log = "401 Client Error: Unauthorized".to_string();
        let obs = observe(&artifact(None), &fetched);
        assert!(obs.size_discovery_failed());
        assert_eq!(obs.failure_detail.unwrap().category, FailureCategory::Auth);
    }
}
