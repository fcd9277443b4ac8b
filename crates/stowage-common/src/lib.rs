//! Common types for Stowage: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod naming;
pub mod quantity;
pub mod telemetry;

pub use error::{Error, ReconcileError};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager for every write the operator performs
pub const FIELD_MANAGER: &str = "stowage-controller";
