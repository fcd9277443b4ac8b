//! Artifact controller for Stowage
//!
//! Reconciles Artifact CRDs into a cached copy of a model on a PVC:
//! - Discovers the size with a check-size Job when it is not declared
//! - Creates a right-sized PVC exactly once
//! - Runs a download Job with a progress-monitor sidecar
//! - Projects Pending/Progressing/Available/Failed status and conditions
//!
//! Each reconcile is a pipeline of pure phases around one fetch and at most
//! one create: [`fetch`](fetch::fetch), [`observe`](observe::observe),
//! [`plan`](plan::plan) and [`project`](project::project).

#![deny(missing_docs)]

pub mod client;
pub mod config;
mod controller;
pub mod failure;
pub mod fetch;
pub mod job;
pub mod names;
pub mod observe;
pub mod plan;
pub mod progress;
pub mod project;
pub mod pvc;

pub use client::{ArtifactClient, KubeArtifactClient};
pub use controller::{error_policy, reconcile, ArtifactContext, CONTROLLER_NAME};
pub use job::TaskImages;
