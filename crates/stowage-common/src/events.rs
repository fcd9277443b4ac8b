//! Kubernetes Event recording for Stowage controllers.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so controllers can
//! emit Events visible via `kubectl describe artifact` and tests can swap in
//! a no-op.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate into reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`.
    ///
    /// `reason` is a machine-readable string from [`reasons`], `action`
    /// one of [`actions`].
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reason strings, shown under REASON in `kubectl get events`.
pub mod reasons {
    /// The size-discovery Job was created
    pub const SIZE_DISCOVERY_STARTED: &str = "SizeDiscoveryStarted";
    /// The cache PVC was created
    pub const STORAGE_CREATED: &str = "StorageCreated";
    /// The download Job was created
    pub const DOWNLOAD_STARTED: &str = "DownloadStarted";
    /// The artifact became Available
    pub const ARTIFACT_AVAILABLE: &str = "ArtifactAvailable";
    /// The artifact entered Failed
    pub const ARTIFACT_FAILED: &str = "ArtifactFailed";
}

/// Event action strings.
pub mod actions {
    /// A child object was created
    pub const CREATE: &str = "Create";
    /// Status was recomputed
    pub const RECONCILE: &str = "Reconcile";
}
