//! Stowage operator - caches model artifacts on cluster storage

mod controller_runner;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use stowage_artifact::job::{DEFAULT_DOWNLOAD_IMAGE, DEFAULT_MONITOR_IMAGE};
use stowage_artifact::TaskImages;
use stowage_common::crd::{Artifact, ClusterRuntimeConfig, RuntimeConfig};
use stowage_common::telemetry::{init_telemetry, TelemetryConfig};
use stowage_common::FIELD_MANAGER;

/// Stowage - declarative model artifact caching for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "stowage", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Image for the check-size and download containers
    #[arg(long, env = "STOWAGE_DOWNLOAD_IMAGE", default_value = DEFAULT_DOWNLOAD_IMAGE)]
    download_image: String,

    /// Image for the progress-monitor sidecar
    #[arg(long, env = "STOWAGE_MONITOR_IMAGE", default_value = DEFAULT_MONITOR_IMAGE)]
    monitor_image: String,

    /// Log human-readable lines instead of JSON
    #[arg(long)]
    text_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Artifact controller (default mode)
    Controller,
}

fn crd_manifests() -> anyhow::Result<String> {
    let docs = [Artifact::crd(), RuntimeConfig::crd(), ClusterRuntimeConfig::crd()]
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
    Ok(docs.join("---\n"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: !cli.text_logs,
        ..Default::default()
    })?;

    let images = TaskImages {
        download: cli.download_image,
        monitor: cli.monitor_image,
    };

    match cli.command {
        Some(Commands::Controller) | None => run_controller(images).await,
    }
}

/// Install or update every Stowage CRD with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Artifact::crd(), RuntimeConfig::crd(), ClusterRuntimeConfig::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("All Stowage CRDs installed/updated");
    Ok(())
}

async fn run_controller(images: TaskImages) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    tracing::info!(
        download_image = %images.download,
        monitor_image = %images.monitor,
        "Starting Stowage controllers"
    );
    let controllers = controller_runner::build_artifact_controllers(client, images);
    futures::future::join_all(controllers).await;

    tracing::info!("Stowage controllers stopped");
    Ok(())
}
