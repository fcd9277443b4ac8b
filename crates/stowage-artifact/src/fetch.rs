//! Fetch phase: point reads of every object the engine depends on
//!
//! Fetching never fails as a whole. Each read lands in a [`FetchResult`] so
//! "absent" and "failed to read" stay distinguishable all the way to the
//! driver, which decides which errors are fatal.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::{debug, warn};

use stowage_common::crd::Artifact;
use stowage_common::Error;

use crate::client::ArtifactClient;
use crate::failure::{
    failed_container, is_pod_failed, pod_phase, POD_PHASE_RUNNING, POD_PHASE_SUCCEEDED,
};
use crate::job::{
    is_job_complete, is_job_failed, CHECK_SIZE_CONTAINER, DOWNLOAD_CONTAINER,
    PROGRESS_MONITOR_CONTAINER,
};
use crate::names::ArtifactNames;
use crate::pvc::{pvc_phase, pvc_storage_class, PHASE_PENDING};

/// Lines of a failed container's log inspected for categorization
pub const FAILURE_LOG_LINES: i64 = 20;

/// Outcome of a single read
#[derive(Debug)]
pub enum FetchResult<T> {
    /// The object exists
    Found(T),
    /// The object does not exist
    Absent,
    /// The read failed
    Errored(Error),
}

impl<T> FetchResult<T> {
    /// Convert a point read where `Ok(None)` means absent
    pub fn from_result(result: Result<Option<T>, Error>) -> Self {
        match result {
            Ok(Some(value)) => Self::Found(value),
            Ok(None) => Self::Absent,
            Err(e) => Self::Errored(e),
        }
    }

    /// The fetched value, if found
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Found(value) => Some(value),
            _ => None,
        }
    }

    /// True when the object exists
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// The read error, if any
    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Errored(e) => Some(e),
            _ => None,
        }
    }
}

impl<T> FetchResult<Vec<T>> {
    /// Convert a list call; lists are never absent
    pub fn from_list(result: Result<Vec<T>, Error>) -> Self {
        match result {
            Ok(items) => Self::Found(items),
            Err(e) => Self::Errored(e),
        }
    }

    /// Listed items, empty when the list failed
    pub fn items(&self) -> &[T] {
        self.value().map(Vec::as_slice).unwrap_or_default()
    }
}

/// Everything read for one artifact in one reconcile
#[derive(Debug)]
pub struct ArtifactFetch {
    /// Cache PVC
    pub pvc: FetchResult<PersistentVolumeClaim>,
    /// Storage class of a pending PVC; `None` when not needed
    pub storage_class: Option<FetchResult<StorageClass>>,
    /// Size-discovery Job; `None` when the size is already known
    pub check_size_job: Option<FetchResult<Job>>,
    /// Pods of the size-discovery Job
    pub check_size_pods: Option<FetchResult<Vec<Pod>>>,
    /// Last line printed by the check-size container
    pub check_size_output: String,
    /// Download Job
    pub download_job: FetchResult<Job>,
    /// Pods of an unfinished download Job
    pub download_pods: Option<FetchResult<Vec<Pod>>>,
    /// Last line printed by the progress monitor
    pub progress_line: String,
    /// Log tail of whichever task container failed
    pub failure_log: String,
}

impl ArtifactFetch {
    /// First read error of an object planning depends on.
    ///
    /// Storage class, pod and log reads only degrade the observation and
    /// are not reported here.
    pub fn blocking_error(&self) -> Option<&Error> {
        self.pvc
            .error()
            .or_else(|| self.check_size_job.as_ref().and_then(FetchResult::error))
            .or_else(|| self.download_job.error())
    }
}

/// True when the size is neither declared nor already discovered
pub fn size_discovery_needed(artifact: &Artifact) -> bool {
    let declared = artifact.spec.declared_size_bytes().ok().flatten();
    let discovered = artifact
        .status
        .as_ref()
        .and_then(|s| s.discovered_size_bytes);
    declared.is_none() && discovered.is_none()
}

fn failed_pod(pods: &[Pod]) -> Option<&Pod> {
    pods.iter().find(|p| is_pod_failed(p))
}

async fn failure_log(
    client: &dyn ArtifactClient,
    namespace: &str,
    pod: &Pod,
    default_container: &str,
) -> String {
    let container = failed_container(pod)
        .map(|(name, _)| name)
        .unwrap_or(default_container);
    client
        .tail_log(namespace, &pod.name_any(), container, FAILURE_LOG_LINES)
        .await
}

fn last_line(log: &str) -> String {
    log.lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Read the current state of every dependent object
pub async fn fetch(
    client: &dyn ArtifactClient,
    artifact: &Artifact,
    namespace: &str,
    names: &ArtifactNames,
) -> ArtifactFetch {
    let name = artifact.name_any();

    let pvc = FetchResult::from_result(client.get_pvc(namespace, &names.pvc).await);

    let storage_class = match pvc.value() {
        Some(claim) if pvc_phase(claim) == Some(PHASE_PENDING) => match pvc_storage_class(claim) {
            Some(class) => Some(FetchResult::from_result(client.get_storage_class(class).await)),
            None => None,
        },
        _ => None,
    };
    if let Some(e) = storage_class.as_ref().and_then(FetchResult::error) {
        warn!(artifact = %name, error = %e, "failed to read storage class");
    }

    let mut fetched = ArtifactFetch {
        pvc,
        storage_class,
        check_size_job: None,
        check_size_pods: None,
        check_size_output: String::new(),
        download_job: FetchResult::Absent,
        download_pods: None,
        progress_line: String::new(),
        failure_log: String::new(),
    };

    if size_discovery_needed(artifact) {
        let job = FetchResult::from_result(client.get_job(namespace, &names.check_size_job).await);
        if job.is_found() {
            let pods = FetchResult::from_list(
                client.list_job_pods(namespace, &names.check_size_job).await,
            );
            if let Some(e) = pods.error() {
                warn!(artifact = %name, job = %names.check_size_job, error = %e, "failed to list pods");
            }

            let output_pod = pods.items().iter().find(|p| {
                matches!(pod_phase(p), Some(POD_PHASE_SUCCEEDED) | Some(POD_PHASE_RUNNING))
            });
            if let Some(pod) = output_pod {
                let log = client
                    .tail_log(namespace, &pod.name_any(), CHECK_SIZE_CONTAINER, 1)
                    .await;
                fetched.check_size_output = last_line(&log);
            }

            let job_failed = job.value().is_some_and(is_job_failed);
            if let Some(pod) = failed_pod(pods.items()) {
                fetched.failure_log = failure_log(client, namespace, pod, CHECK_SIZE_CONTAINER).await;
            } else if job_failed {
                debug!(artifact = %name, "check-size job failed with no failed pod left");
            }
            fetched.check_size_pods = Some(pods);
        }
        fetched.check_size_job = Some(job);
    }

    fetched.download_job =
        FetchResult::from_result(client.get_job(namespace, &names.download_job).await);

    if let Some(job) = fetched.download_job.value() {
        if !is_job_complete(job) {
            let pods = FetchResult::from_list(
                client.list_job_pods(namespace, &names.download_job).await,
            );
            if let Some(e) = pods.error() {
                warn!(artifact = %name, job = %names.download_job, error = %e, "failed to list pods");
            }

            if let Some(pod) = pods
                .items()
                .iter()
                .find(|p| pod_phase(p) == Some(POD_PHASE_RUNNING))
            {
                let log = client
                    .tail_log(namespace, &pod.name_any(), PROGRESS_MONITOR_CONTAINER, 1)
                    .await;
                fetched.progress_line = last_line(&log);
            }

            if let Some(pod) = failed_pod(pods.items()) {
                fetched.failure_log = failure_log(client, namespace, pod, DOWNLOAD_CONTAINER).await;
            }
            fetched.download_pods = Some(pods);
        }
    }

    fetched
}
