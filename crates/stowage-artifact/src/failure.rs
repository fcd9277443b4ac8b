//! Task failure inspection and categorization
//!
//! A failed pod is visible before the Job controller promotes it to a
//! `Failed` Job condition, so both are inspected. The categorization looks
//! at, in order: the Job failure reason, the pod status reason, terminated
//! container reasons and finally the tail of the failed container's log.

use std::sync::LazyLock;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use regex::Regex;

use stowage_common::crd::{FailureCategory, FailureDetail};

use crate::job::{job_failure_message, job_failure_reason};

/// Pod phase of a pod whose containers all terminated and at least one failed
pub const POD_PHASE_FAILED: &str = "Failed";
/// Pod phase while containers are running
pub const POD_PHASE_RUNNING: &str = "Running";
/// Pod phase once all containers exited zero
pub const POD_PHASE_SUCCEEDED: &str = "Succeeded";

/// Longest failure message copied into status
const MAX_MESSAGE_LEN: usize = 256;

static AUTH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(401|403)\b|unauthori[sz]ed|forbidden|gated repo|access denied|invalid (access )?token|invalid credentials")
        .expect("auth regex is valid")
});

static NOT_FOUND_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b404\b|repository not found|repo(sitory)? .* does not exist|no ?such ?(bucket|key)")
        .expect("not-found regex is valid")
});

static STORAGE_FULL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no space left on device|disk quota exceeded|\benospc\b")
        .expect("storage-full regex is valid")
});

/// True when the pod reached the `Failed` phase
pub fn is_pod_failed(pod: &Pod) -> bool {
    pod_phase(pod) == Some(POD_PHASE_FAILED)
}

/// Phase reported in the pod status, if any
pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// First container (init containers included) that terminated non-zero.
///
/// Returns the container name and its terminated reason.
pub fn failed_container(pod: &Pod) -> Option<(&str, Option<&str>)> {
    let status = pod.status.as_ref()?;
    status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .find_map(|cs| {
            let terminated = cs
                .state
                .as_ref()
                .and_then(|s| s.terminated.as_ref())
                .or_else(|| cs.last_state.as_ref().and_then(|s| s.terminated.as_ref()))?;
            (terminated.exit_code != 0).then(|| (cs.name.as_str(), terminated.reason.as_deref()))
        })
}

fn truncate(message: &str) -> String {
    let message = message.trim();
    if message.len() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

fn last_non_empty_line(log: &str) -> Option<&str> {
    log.lines().map(str::trim).rfind(|l| !l.is_empty())
}

/// Categorize a log tail by well-known error patterns
pub fn categorize_log(log: &str) -> Option<FailureCategory> {
    if STORAGE_FULL_PATTERN.is_match(log) {
        Some(FailureCategory::StorageFull)
    } else if AUTH_PATTERN.is_match(log) {
        Some(FailureCategory::Auth)
    } else if NOT_FOUND_PATTERN.is_match(log) {
        Some(FailureCategory::NotFound)
    } else {
        None
    }
}

/// Categorize a task failure.
///
/// `pod` is the failed pod when one is known and `log_tail` the last lines
/// of its failed container (empty when unavailable).
pub fn categorize_failure(job: Option<&Job>, pod: Option<&Pod>, log_tail: &str) -> FailureDetail {
    if job.and_then(job_failure_reason) == Some("DeadlineExceeded") {
        return FailureDetail {
            category: FailureCategory::DeadlineExceeded,
            message: truncate(
                &job.and_then(job_failure_message)
                    .unwrap_or_else(|| "job exceeded its active deadline".to_string()),
            ),
        };
    }

    if let Some(pod) = pod {
        let status = pod.status.as_ref();
        if status.and_then(|s| s.reason.as_deref()) == Some("Evicted") {
            let message = status
                .and_then(|s| s.message.clone())
                .unwrap_or_else(|| "pod was evicted".to_string());
            return FailureDetail {
                category: FailureCategory::Evicted,
                message: truncate(&message),
            };
        }

        if let Some((container, Some("OOMKilled"))) = failed_container(pod) {
            return FailureDetail {
                category: FailureCategory::OutOfMemory,
                message: format!("container {container} was OOM killed"),
            };
        }
    }

    let fallback = last_non_empty_line(log_tail)
        .map(str::to_string)
        .or_else(|| job.and_then(job_failure_message))
        .unwrap_or_else(|| "task failed".to_string());

    FailureDetail {
        category: categorize_log(log_tail).unwrap_or(FailureCategory::Unknown),
        message: truncate(&fallback),
    }
}
