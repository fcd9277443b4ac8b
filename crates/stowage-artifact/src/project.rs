//! Project phase: the artifact status computed from an observation
//!
//! Status is rebuilt in full on every reconcile. All conditions and the
//! overall state are derived from one [`StatusFlags`] value so they cannot
//! disagree with each other.

use chrono::{DateTime, Utc};

use stowage_common::crd::{
    condition_types, preserve_transition_times, Artifact, ArtifactState, ArtifactStatus,
    Condition, ConditionStatus, DownloadProgress,
};
use stowage_common::quantity::format_bytes_human_readable;

use crate::config::ResolvedConfig;
use crate::observe::{Observation, SizeSource, StorageState, TaskState};
use crate::plan::can_create_download;
use crate::progress::{Progress, DISPLAY_NOT_AVAILABLE};
use crate::pvc::pvc_requested_storage;

/// Condition reasons
pub mod reasons {
    /// Size taken from `spec.size`
    pub const DECLARED: &str = "Declared";
    /// Size reported by a check-size Job
    pub const DISCOVERED: &str = "Discovered";
    /// check-size Job pending or running
    pub const DISCOVERING: &str = "Discovering";
    /// check-size finished but printed no usable size
    pub const INVALID_SIZE_OUTPUT: &str = "InvalidSizeOutput";
    /// check-size Job failed
    pub const DISCOVERY_FAILED: &str = "DiscoveryFailed";
    /// `spec.size` does not parse
    pub const INVALID_SIZE: &str = "InvalidSize";

    /// PVC bound
    pub const PVC_BOUND: &str = "PVCBound";
    /// PVC not created yet
    pub const PVC_NOT_CREATED: &str = "PVCNotCreated";
    /// PVC waiting for a volume
    pub const PVC_PROVISIONING: &str = "PVCProvisioning";
    /// PVC lost its volume
    pub const PVC_LOST: &str = "PVCLost";
    /// PVC cannot be sized yet
    pub const WAITING_FOR_SIZE: &str = "WaitingForSize";
    /// PVC in an unrecognized phase
    pub const PVC_UNKNOWN: &str = "PVCUnknown";

    /// Download finished on bound storage
    pub const AVAILABLE: &str = "Available";
    /// Storage not usable yet
    pub const WAITING_FOR_STORAGE: &str = "WaitingForStorage";
    /// Download Job pending or running
    pub const DOWNLOADING: &str = "Downloading";
    /// Download Job or pod failed
    pub const DOWNLOAD_FAILED: &str = "DownloadFailed";
    /// PVC lost its volume
    pub const STORAGE_LOST: &str = "StorageLost";

    /// Size unknown and discovery turned off in the runtime config
    pub const DISCOVERY_DISABLED: &str = "DiscoveryDisabled";
    /// Size discovery in flight
    pub const DISCOVERING_SIZE: &str = "DiscoveringSize";
    /// A terminal failure was observed
    pub const FAILED: &str = "Failed";
    /// Nothing to do and nothing in flight
    pub const IDLE: &str = "Idle";

    /// check-size Job failed
    pub const SIZE_DISCOVERY_FAILED: &str = "SizeDiscoveryFailed";
    /// Named runtime config missing
    pub const CONFIG_NOT_FOUND: &str = "ConfigNotFound";
    /// Artifact spec failed validation
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// No failure
    pub const NO_FAILURE: &str = "NoFailure";
}

/// Booleans every condition and the overall state derive from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusFlags {
    /// Size declared or discovered
    pub size_known: bool,
    /// PVC bound
    pub storage_ready: bool,
    /// PVC lost
    pub storage_lost: bool,
    /// PVC pending with a WaitForFirstConsumer class
    pub storage_pending_wait_for_first_consumer: bool,
    /// Download finished now or in an earlier reconcile
    pub download_succeeded: bool,
    /// Download Job or pod failed
    pub download_failed: bool,
    /// Download Job exists and is unfinished
    pub download_pending_or_running: bool,
    /// No download Job exists
    pub job_absent: bool,
    /// check-size Job failed while the size is unknown
    pub size_discovery_failed: bool,
    /// `storage_ready && download_succeeded`
    pub ready: bool,
    /// Any terminal failure
    pub failure: bool,
    /// A download Job may be created on the current storage
    pub can_create_job: bool,
    /// Work is outstanding and nothing failed
    pub progressing: bool,
}

impl StatusFlags {
    /// Derive all flags from an observation.
    ///
    /// With `auto_discovery` off, an artifact of unknown size is idle rather
    /// than progressing.
    pub fn derive(obs: &Observation, auto_discovery: bool) -> Self {
        let storage_ready = obs.storage_ready();
        let storage_lost = obs.storage_lost();
        let download_succeeded = obs.download_succeeded();
        let download_failed = obs.download_failed();
        let download_pending_or_running = obs.download_pending_or_running();
        let job_absent = obs.download_absent();
        let size_discovery_failed = obs.size_discovery_failed();

        let ready = storage_ready && download_succeeded;
        let failure = storage_lost || download_failed || size_discovery_failed;
        let can_create_job = can_create_download(obs);
        let size_obtainable = obs.size_known() || auto_discovery;
        let progressing = !ready
            && !failure
            && size_obtainable
            && (!storage_ready || download_pending_or_running || (job_absent && can_create_job));

        Self {
            size_known: obs.size_known(),
            storage_ready,
            storage_lost,
            storage_pending_wait_for_first_consumer: obs.storage_pending_wait_for_first_consumer(),
            download_succeeded,
            download_failed,
            download_pending_or_running,
            job_absent,
            size_discovery_failed,
            ready,
            failure,
            can_create_job,
            progressing,
        }
    }

    /// Overall state; failure wins over everything
    pub fn state(&self) -> ArtifactState {
        if self.failure {
            ArtifactState::Failed
        } else if self.ready {
            ArtifactState::Available
        } else if self.progressing {
            ArtifactState::Progressing
        } else {
            ArtifactState::Pending
        }
    }
}

/// Why a reconcile stopped before fetching
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Blocker {
    /// The referenced runtime config does not exist
    ConfigNotFound(String),
    /// The artifact spec is invalid
    InvalidSpec(String),
}

fn display_size(bytes: i64) -> Option<String> {
    format_bytes_human_readable(bytes).ok()
}

fn size_condition(obs: &Observation, flags: &StatusFlags, auto_discovery: bool) -> Condition {
    let (status, reason, message) = match obs.size {
        Some(SizeSource::Declared(bytes)) => (
            ConditionStatus::True,
            reasons::DECLARED,
            format!("Size declared as {bytes} bytes"),
        ),
        Some(SizeSource::Discovered(bytes)) => (
            ConditionStatus::True,
            reasons::DISCOVERED,
            format!("Size discovered as {bytes} bytes"),
        ),
        None if flags.size_discovery_failed => (
            ConditionStatus::False,
            reasons::DISCOVERY_FAILED,
            "Size discovery job failed".to_string(),
        ),
        None if !auto_discovery && obs.check_size == TaskState::Absent => (
            ConditionStatus::False,
            reasons::DISCOVERY_DISABLED,
            "Size discovery is disabled; set spec.size".to_string(),
        ),
        None => match &obs.size_output_error {
            Some(e) => (
                ConditionStatus::False,
                reasons::INVALID_SIZE_OUTPUT,
                e.to_string(),
            ),
            None => (
                ConditionStatus::False,
                reasons::DISCOVERING,
                "Discovering artifact size".to_string(),
            ),
        },
    };
    Condition::new(condition_types::SIZE_KNOWN, status, reason, message)
}

fn storage_condition(obs: &Observation) -> Condition {
    let (status, reason, message) = match &obs.storage {
        StorageState::Bound => (ConditionStatus::True, reasons::PVC_BOUND, "PVC is bound".to_string()),
        StorageState::Lost => (
            ConditionStatus::False,
            reasons::PVC_LOST,
            "PVC lost its bound volume".to_string(),
        ),
        StorageState::Pending {
            wait_for_first_consumer,
        } => (
            ConditionStatus::False,
            reasons::PVC_PROVISIONING,
            if *wait_for_first_consumer {
                "PVC waits for its first consumer".to_string()
            } else {
                "PVC is waiting for a volume".to_string()
            },
        ),
        StorageState::Absent if !obs.size_known() => (
            ConditionStatus::False,
            reasons::WAITING_FOR_SIZE,
            "PVC is created once the size is known".to_string(),
        ),
        StorageState::Absent => (
            ConditionStatus::False,
            reasons::PVC_NOT_CREATED,
            "PVC not created yet".to_string(),
        ),
        StorageState::Unknown(phase) => (
            ConditionStatus::False,
            reasons::PVC_UNKNOWN,
            format!("PVC phase is {}", phase.as_deref().unwrap_or("unset")),
        ),
    };
    Condition::new(condition_types::STORAGE_READY, status, reason, message)
}

fn ready_condition(flags: &StatusFlags) -> Condition {
    let (status, reason, message) = if flags.ready {
        (ConditionStatus::True, reasons::AVAILABLE, "Artifact is cached and ready")
    } else if flags.storage_lost {
        (ConditionStatus::False, reasons::STORAGE_LOST, "Artifact storage was lost")
    } else if flags.download_failed {
        (ConditionStatus::False, reasons::DOWNLOAD_FAILED, "Download failed")
    } else if !flags.storage_ready && !flags.download_pending_or_running {
        (ConditionStatus::False, reasons::WAITING_FOR_STORAGE, "Waiting for storage")
    } else {
        (ConditionStatus::False, reasons::DOWNLOADING, "Download in progress")
    };
    Condition::new(condition_types::READY, status, reason, message)
}

fn progressing_condition(flags: &StatusFlags) -> Condition {
    let (status, reason, message) = if flags.ready {
        (ConditionStatus::False, reasons::AVAILABLE, "Nothing left to do")
    } else if flags.failure {
        (ConditionStatus::False, reasons::FAILED, "Stopped after a failure")
    } else if !flags.progressing {
        (ConditionStatus::False, reasons::IDLE, "Waiting on external state")
    } else if !flags.size_known {
        (ConditionStatus::True, reasons::DISCOVERING_SIZE, "Discovering artifact size")
    } else if !flags.storage_ready && !flags.download_pending_or_running {
        (ConditionStatus::True, reasons::WAITING_FOR_STORAGE, "Provisioning storage")
    } else {
        (ConditionStatus::True, reasons::DOWNLOADING, "Downloading artifact")
    };
    Condition::new(condition_types::PROGRESSING, status, reason, message)
}

fn failure_condition(obs: &Observation, flags: &StatusFlags) -> Condition {
    let detail = obs
        .failure_detail
        .as_ref()
        .map(|d| format!(" ({}: {})", d.category, d.message))
        .unwrap_or_default();
    let (status, reason, message) = if flags.storage_lost {
        (ConditionStatus::True, reasons::PVC_LOST, "PVC lost its bound volume".to_string())
    } else if flags.download_failed {
        (ConditionStatus::True, reasons::DOWNLOAD_FAILED, format!("Download failed{detail}"))
    } else if flags.size_discovery_failed {
        (
            ConditionStatus::True,
            reasons::SIZE_DISCOVERY_FAILED,
            format!("Size discovery failed{detail}"),
        )
    } else {
        (ConditionStatus::False, reasons::NO_FAILURE, String::new())
    };
    Condition::new(condition_types::FAILURE, status, reason, message)
}

fn to_status_progress(progress: Progress) -> DownloadProgress {
    DownloadProgress {
        total_bytes: progress.total_bytes,
        downloaded_bytes: progress.downloaded_bytes,
        percentage: progress.percentage,
        display_percentage: progress.display(),
    }
}

fn project_progress(
    obs: &Observation,
    flags: &StatusFlags,
    previous: Option<&DownloadProgress>,
) -> Option<DownloadProgress> {
    if flags.download_failed {
        let mut progress = previous.cloned().unwrap_or_default();
        progress.display_percentage = DISPLAY_NOT_AVAILABLE.to_string();
        return Some(progress);
    }
    if flags.download_succeeded {
        let total = obs.effective_size().unwrap_or_default();
        return Some(to_status_progress(Progress::complete(total)));
    }
    obs.progress
        .map(to_status_progress)
        .or_else(|| previous.cloned())
}

/// Compute the full status for `artifact` from an observation
pub fn project(
    artifact: &Artifact,
    obs: &Observation,
    config: &ResolvedConfig,
    namespace: &str,
    now: DateTime<Utc>,
) -> ArtifactStatus {
    let previous = artifact.status.clone().unwrap_or_default();
    let auto_discovery = config.effective.auto_discovery();
    let flags = StatusFlags::derive(obs, auto_discovery);

    let mut conditions = vec![
        config.condition(namespace),
        size_condition(obs, &flags, auto_discovery),
        storage_condition(obs),
        ready_condition(&flags),
        progressing_condition(&flags),
        failure_condition(obs, &flags),
    ];
    preserve_transition_times(&mut conditions, &previous.conditions);

    let (allocated_size, headroom_percent) = match (&previous.allocated_size, &obs.pvc) {
        (None, Some(pvc)) => (
            pvc_requested_storage(pvc).map(|q| q.0.clone()),
            Some(config.effective.pvc_headroom_percent()),
        ),
        _ => (previous.allocated_size.clone(), previous.headroom_percent),
    };

    let completed_at = match obs.download {
        TaskState::Succeeded => previous.completed_at.or(Some(now)),
        _ => previous.completed_at,
    };

    let failure_detail = obs
        .failure_detail
        .clone()
        .or_else(|| previous.failure_detail.clone().filter(|_| flags.failure));

    ArtifactStatus {
        status: flags.state(),
        observed_generation: artifact.metadata.generation,
        conditions,
        persistent_volume_claim: obs
            .pvc
            .as_ref()
            .and_then(|p| p.metadata.name.clone())
            .or(previous.persistent_volume_claim.clone()),
        discovered_size_bytes: previous.discovered_size_bytes.or(obs.newly_discovered_size),
        display_size: obs.effective_size().and_then(display_size),
        allocated_size,
        headroom_percent,
        progress: project_progress(obs, &flags, previous.progress.as_ref()),
        completed_at,
        failure_detail,
    }
}

/// Status for a reconcile that stopped before fetching.
///
/// Fields derived from earlier observations are carried over unchanged.
pub fn project_blocked(
    artifact: &Artifact,
    config: &ResolvedConfig,
    blocker: &Blocker,
    namespace: &str,
) -> ArtifactStatus {
    let previous = artifact.status.clone().unwrap_or_default();

    let mut conditions = vec![config.condition(namespace)];
    let (reason, message) = match blocker {
        Blocker::ConfigNotFound(message) => (reasons::CONFIG_NOT_FOUND, message.clone()),
        Blocker::InvalidSpec(message) => {
            if artifact.spec.declared_size_bytes().is_err() {
                conditions.push(Condition::new(
                    condition_types::SIZE_KNOWN,
                    ConditionStatus::False,
                    reasons::INVALID_SIZE,
                    message.clone(),
                ));
            }
            (reasons::INVALID_SPEC, message.clone())
        }
    };
    conditions.push(Condition::new(
        condition_types::PROGRESSING,
        ConditionStatus::False,
        reasons::FAILED,
        "Stopped after a failure",
    ));
    conditions.push(Condition::new(
        condition_types::FAILURE,
        ConditionStatus::True,
        reason,
        message,
    ));
    preserve_transition_times(&mut conditions, &previous.conditions);

    ArtifactStatus {
        status: ArtifactState::Failed,
        observed_generation: artifact.metadata.generation,
        conditions,
        ..previous
    }
}
