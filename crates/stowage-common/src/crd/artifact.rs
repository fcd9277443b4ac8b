//! Artifact CRD: a model artifact cached into a dedicated PVC
//!
//! An Artifact names a source (`hf://org/model`, `s3://bucket/path`) and an
//! optional size. The artifact controller discovers the size when it is not
//! declared, provisions a PVC with headroom, runs a download Job into it and
//! reports progress on the status subresource.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{EnvVar, LocalObjectReference};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::quantity::parse_quantity_bytes;

/// Name of the runtime config used when an artifact does not reference one
pub const DEFAULT_RUNTIME_CONFIG_NAME: &str = "default";

/// Source URI schemes the downloader understands
pub const SUPPORTED_SOURCE_SCHEMES: [&str; 2] = ["hf://", "s3://"];

/// Condition types reported on `ArtifactStatus`
pub mod condition_types {
    /// Runtime configuration lookup result
    pub const RUNTIME_CONFIG_RESOLVED: &str = "RuntimeConfigResolved";
    /// Whether the artifact size is known (declared or discovered)
    pub const SIZE_KNOWN: &str = "SizeKnown";
    /// Whether the cache PVC is bound
    pub const STORAGE_READY: &str = "StorageReady";
    /// Whether the artifact is fully cached and usable
    pub const READY: &str = "Ready";
    /// Whether work is outstanding
    pub const PROGRESSING: &str = "Progressing";
    /// Whether a terminal failure was observed
    pub const FAILURE: &str = "Failure";
}

/// Artifact specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "stowage.dev",
    version = "v1alpha1",
    kind = "Artifact",
    plural = "artifacts",
    shortname = "art",
    namespaced,
    status = "ArtifactStatus",
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.sourceUri"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Size","type":"string","jsonPath":".status.displaySize"}"#,
    printcolumn = r#"{"name":"Progress","type":"string","jsonPath":".status.progress.displayPercentage"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSpec {
    /// Where to download from (`hf://org/model`, `s3://bucket/prefix`)
    pub source_uri: String,

    /// Declared artifact size as a Kubernetes quantity (e.g. "140Gi").
    ///
    /// Absent or zero means the size is discovered by a check-size Job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Storage class for the cache PVC, overriding the runtime config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Downloader image, overriding the operator default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_image: Option<String>,

    /// Environment for the download container, highest precedence
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Name of the RuntimeConfig / ClusterRuntimeConfig to apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_config_name: Option<String>,

    /// Pull secrets for the check-size and download pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
}

impl ArtifactSpec {
    /// Validate the spec, returning a user-facing message on failure
    pub fn validate(&self) -> Result<(), String> {
        if !SUPPORTED_SOURCE_SCHEMES
            .iter()
            .any(|s| self.source_uri.starts_with(s))
        {
            return Err(format!(
                "sourceUri must start with one of: {}",
                SUPPORTED_SOURCE_SCHEMES.join(", ")
            ));
        }
        if self.source_uri.len() <= "s3://".len() {
            return Err("sourceUri has no path after the scheme".to_string());
        }
        self.declared_size_bytes()
            .map_err(|e| format!("invalid size: {e}"))?;
        Ok(())
    }

    /// Declared size in bytes; `None` when absent or zero
    pub fn declared_size_bytes(&self) -> crate::Result<Option<i64>> {
        match self.size.as_deref() {
            None => Ok(None),
            Some(q) => {
                let bytes = parse_quantity_bytes(q)?;
                Ok((bytes > 0).then_some(bytes))
            }
        }
    }

    /// The referenced runtime config name, with empty meaning `default`
    pub fn runtime_config_name(&self) -> &str {
        match self.runtime_config_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_RUNTIME_CONFIG_NAME,
        }
    }
}

/// Overall artifact state
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ArtifactState {
    /// Nothing is happening yet
    #[default]
    Pending,
    /// Size discovery, provisioning or download in flight
    Progressing,
    /// Download complete and storage bound
    Available,
    /// A terminal failure was observed
    Failed,
}

impl std::fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Progressing => write!(f, "Progressing"),
            Self::Available => write!(f, "Available"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Download progress as last observed
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    /// Expected total size in bytes
    pub total_bytes: i64,
    /// Bytes written to the cache so far
    pub downloaded_bytes: i64,
    /// Completion percentage in `[0, 100]`
    pub percentage: i32,
    /// Display form, e.g. "45 %" or "N/A" after a failure
    pub display_percentage: String,
}

/// Coarse classification of a task failure
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum FailureCategory {
    /// Credentials missing, rejected or repository gated
    Auth,
    /// Source repository, bucket or object does not exist
    NotFound,
    /// The cache volume ran out of space
    StorageFull,
    /// A container was OOM killed
    OutOfMemory,
    /// The pod was evicted by the kubelet
    Evicted,
    /// The Job exceeded its active deadline
    DeadlineExceeded,
    /// Nothing more specific could be determined
    Unknown,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auth => "Auth",
            Self::NotFound => "NotFound",
            Self::StorageFull => "StorageFull",
            Self::OutOfMemory => "OutOfMemory",
            Self::Evicted => "Evicted",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// Categorized failure of a check-size or download task
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
    /// Failure classification
    pub category: FailureCategory,
    /// Short human-readable explanation
    pub message: String,
}

/// Status of an Artifact
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactStatus {
    /// Overall state
    #[serde(default)]
    pub status: ArtifactState,

    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Named conditions, see [`condition_types`]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Name of the cache PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<String>,

    /// Size reported by the check-size Job; written once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_size_bytes: Option<i64>,

    /// Effective size in human-readable form. Serialized as `null` when
    /// unset so a status merge-patch clears it.
    #[serde(default)]
    pub display_size: Option<String>,

    /// Storage requested for the PVC, as a quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_size: Option<String>,

    /// Headroom percent applied when the PVC was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headroom_percent: Option<i32>,

    /// Download progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<DownloadProgress>,

    /// When the download Job was first observed complete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Categorized cause of the most recent task failure. Serialized as
    /// `null` when unset so a status merge-patch clears it.
    #[serde(default)]
    pub failure_detail: Option<FailureDetail>,
}
