//! Custom Resource Definitions for Stowage
//!
//! `Artifact` is the resource under reconciliation; `RuntimeConfig` and
//! `ClusterRuntimeConfig` carry layered defaults for it.

mod artifact;
mod runtime_config;
mod types;

pub use artifact::{
    condition_types, Artifact, ArtifactSpec, ArtifactState, ArtifactStatus, DownloadProgress,
    FailureCategory, FailureDetail, DEFAULT_RUNTIME_CONFIG_NAME, SUPPORTED_SOURCE_SCHEMES,
};
pub use runtime_config::{
    merge_env, ClusterRuntimeConfig, ClusterRuntimeConfigSpec, ModelConfig, RoutingConfig,
    RuntimeConfig, RuntimeConfigCommon, RuntimeConfigSpec, StorageConfig,
    DEFAULT_PVC_HEADROOM_PERCENT, MAX_PVC_HEADROOM_PERCENT,
};
pub use types::{find_condition, preserve_transition_times, Condition, ConditionStatus};
