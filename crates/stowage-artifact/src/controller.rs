//! Artifact reconciliation controller
//!
//! Every reconcile runs the same pipeline:
//! - resolve the layered runtime config and validate the spec
//! - fetch the PVC, the size-discovery Job and the download Job
//! - observe typed state, plan at most one create, apply it
//! - project the full status and patch it when it changed

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use stowage_common::crd::{
    condition_types, find_condition, Artifact, ArtifactState, ArtifactStatus,
};
use stowage_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use stowage_common::ReconcileError;

use crate::client::{ArtifactClient, KubeArtifactClient};
use crate::config::resolve_runtime_config;
use crate::fetch::fetch;
use crate::job::TaskImages;
use crate::names::ArtifactNames;
use crate::observe::observe;
use crate::plan::{plan, PlannedObject};
use crate::project::{project, project_blocked, Blocker};

/// Name reported on Events
pub const CONTROLLER_NAME: &str = "stowage-artifact-controller";

/// Requeue while work is outstanding
pub const REQUEUE_ACTIVE: Duration = Duration::from_secs(10);
/// Requeue once Available or Failed
pub const REQUEUE_SETTLED: Duration = Duration::from_secs(300);
/// Requeue while the referenced runtime config is missing
pub const REQUEUE_CONFIG_NOT_FOUND: Duration = Duration::from_secs(60);
/// Requeue after a reconcile error
pub const REQUEUE_ERROR: Duration = Duration::from_secs(30);

/// Context for the artifact controller
pub struct ArtifactContext {
    /// Kubernetes access
    pub kube: Arc<dyn ArtifactClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Task container images
    pub images: TaskImages,
}

impl ArtifactContext {
    /// Create a context backed by a real client
    pub fn new(client: Client, images: TaskImages) -> Self {
        Self {
            kube: Arc::new(KubeArtifactClient::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            images,
        }
    }

    /// Create a context for testing with a mock client and no Events
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn ArtifactClient>) -> Self {
        Self {
            kube,
            events: Arc::new(stowage_common::events::NoopEventPublisher),
            images: TaskImages::default(),
        }
    }
}

/// Error policy for the artifact controller.
///
/// Logs the error and requeues for retry after 30 seconds.
pub fn error_policy(
    artifact: Arc<Artifact>,
    error: &ReconcileError,
    _ctx: Arc<ArtifactContext>,
) -> Action {
    warn!(artifact = %artifact.name_any(), error = %error, "Artifact reconcile error, will retry");
    Action::requeue(REQUEUE_ERROR)
}

fn requeue_for(state: ArtifactState) -> Duration {
    match state {
        ArtifactState::Pending | ArtifactState::Progressing => REQUEUE_ACTIVE,
        ArtifactState::Available | ArtifactState::Failed => REQUEUE_SETTLED,
    }
}

/// Reconcile one Artifact
pub async fn reconcile(
    artifact: Arc<Artifact>,
    ctx: Arc<ArtifactContext>,
) -> Result<Action, ReconcileError> {
    let name = artifact.name_any();
    let namespace = artifact
        .namespace()
        .ok_or_else(|| ReconcileError::Validation("Artifact must be namespaced".into()))?;
    let client = ctx.kube.as_ref();

    info!(artifact = %name, namespace = %namespace, "Reconciling Artifact");

    let config = resolve_runtime_config(client, &artifact).await?;

    let blocker = if config.is_not_found() {
        Some(Blocker::ConfigNotFound(config.not_found_message(&namespace)))
    } else {
        artifact.spec.validate().err().map(Blocker::InvalidSpec)
    };
    if let Some(blocker) = blocker {
        warn!(artifact = %name, ?blocker, "Artifact cannot be reconciled");
        let status = project_blocked(&artifact, &config, &blocker, &namespace);
        write_status(ctx.as_ref(), &artifact, &namespace, status).await?;
        return Ok(Action::requeue(match blocker {
            Blocker::ConfigNotFound(_) => REQUEUE_CONFIG_NOT_FOUND,
            Blocker::InvalidSpec(_) => REQUEUE_SETTLED,
        }));
    }

    let names = ArtifactNames::for_artifact(&artifact)?;
    let fetched = fetch(client, &artifact, &namespace, &names).await;
    if let Some(e) = fetched.blocking_error() {
        return Err(ReconcileError::Kube(format!(
            "failed to read dependent objects: {e}"
        )));
    }

    let observation = observe(&artifact, &fetched);
    debug!(
        artifact = %name,
        storage = ?observation.storage,
        download = ?observation.download,
        "Observed dependent objects"
    );

    if let Some(object) = plan(
        &artifact,
        &observation,
        &names,
        &config.effective,
        &ctx.images,
    )? {
        apply(ctx.as_ref(), &artifact, &object).await?;
    }

    let status = project(&artifact, &observation, &config, &namespace, Utc::now());
    let state = status.status;
    write_status(ctx.as_ref(), &artifact, &namespace, status).await?;

    Ok(Action::requeue(requeue_for(state)))
}

/// Create a planned object; an existing object of the same name is success
async fn apply(
    ctx: &ArtifactContext,
    artifact: &Artifact,
    object: &PlannedObject,
) -> Result<(), ReconcileError> {
    let name = artifact.name_any();
    let object_name = object.name().unwrap_or_default().to_string();

    let result = match object {
        PlannedObject::CheckSizeJob(job) | PlannedObject::DownloadJob(job) => {
            ctx.kube.create_job(job).await
        }
        PlannedObject::Pvc(pvc) => ctx.kube.create_pvc(pvc).await,
    };

    match result {
        Ok(()) => {
            info!(artifact = %name, kind = object.kind(), object = %object_name, "Created");
            let reason = match object {
                PlannedObject::CheckSizeJob(_) => reasons::SIZE_DISCOVERY_STARTED,
                PlannedObject::Pvc(_) => reasons::STORAGE_CREATED,
                PlannedObject::DownloadJob(_) => reasons::DOWNLOAD_STARTED,
            };
            ctx.events
                .publish(
                    &artifact.object_ref(&()),
                    EventType::Normal,
                    reason,
                    actions::CREATE,
                    Some(format!("Created {} {object_name}", object.kind())),
                )
                .await;
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!(artifact = %name, object = %object_name, "Already exists, nothing to create");
            Ok(())
        }
        Err(e) => Err(ReconcileError::Kube(format!(
            "failed to create {} {object_name}: {e}",
            object.kind()
        ))),
    }
}

/// Patch `status` when it differs from the stored one and announce
/// transitions into Available or Failed
async fn write_status(
    ctx: &ArtifactContext,
    artifact: &Artifact,
    namespace: &str,
    status: ArtifactStatus,
) -> Result<(), ReconcileError> {
    let name = artifact.name_any();
    let previous = artifact.status.as_ref();
    if previous == Some(&status) {
        debug!(artifact = %name, "Status unchanged, skipping patch");
        return Ok(());
    }

    ctx.kube.patch_status(namespace, &name, &status).await?;

    let previous_state = previous.map(|s| s.status).unwrap_or_default();
    if previous_state == status.status {
        return Ok(());
    }
    info!(artifact = %name, from = %previous_state, to = %status.status, "Artifact state changed");

    let event = match status.status {
        ArtifactState::Failed => Some((
            EventType::Warning,
            reasons::ARTIFACT_FAILED,
            find_condition(&status.conditions, condition_types::FAILURE)
                .map(|c| format!("{}: {}", c.reason, c.message)),
        )),
        ArtifactState::Available => Some((
            EventType::Normal,
            reasons::ARTIFACT_AVAILABLE,
            status.display_size.as_ref().map(|s| format!("Cached {s}")),
        )),
        ArtifactState::Pending | ArtifactState::Progressing => None,
    };
    if let Some((type_, reason, note)) = event {
        ctx.events
            .publish(&artifact.object_ref(&()), type_, reason, actions::RECONCILE, note)
            .await;
    }
    Ok(())
}
