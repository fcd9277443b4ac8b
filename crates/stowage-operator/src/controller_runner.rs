//! Controller runner - builds the controller futures the binary drives

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use stowage_artifact::{error_policy, reconcile, ArtifactContext, TaskImages};
use stowage_common::crd::Artifact;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be polled
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the Artifact controller.
///
/// Owned Jobs and PVCs trigger a reconcile of their Artifact, so Job
/// completion and PVC binding are picked up without waiting for the requeue.
pub fn build_artifact_controllers(client: Client, images: TaskImages) -> Vec<ControllerFuture> {
    let ctx = Arc::new(ArtifactContext::new(client.clone(), images));
    let artifacts: Api<Artifact> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client.clone());
    let pvcs: Api<PersistentVolumeClaim> = Api::all(client);

    tracing::info!("- Artifact controller");

    vec![Box::pin(
        Controller::new(artifacts, watcher_config())
            .owns(jobs, watcher_config())
            .owns(pvcs, watcher_config())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Artifact")),
    )]
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
