//! Names of the objects generated for an artifact
//!
//! Every name is derived from the artifact name plus a hash of its UID, so
//! a deleted-and-recreated artifact never adopts its predecessor's objects.

use kube::ResourceExt;
use serde_json::json;

use stowage_common::crd::Artifact;
use stowage_common::naming::{derive_name, MAX_NAME_LENGTH};
use stowage_common::{Error, Result};

/// Component label value and name part for the cache PVC
pub const COMPONENT_CACHE: &str = "cache";
/// Component label value and name part for the size-discovery Job
pub const COMPONENT_CHECK_SIZE: &str = "check-size";
/// Component label value and name part for the download Job
pub const COMPONENT_DOWNLOAD: &str = "download";

/// Derived names for one artifact
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactNames {
    /// Cache PVC
    pub pvc: String,
    /// Size-discovery Job
    pub check_size_job: String,
    /// Download Job
    pub download_job: String,
}

impl ArtifactNames {
    /// Derive all names; fails when the artifact has no UID yet
    pub fn for_artifact(artifact: &Artifact) -> Result<Self> {
        let name = artifact.name_any();
        let uid = artifact
            .uid()
            .ok_or_else(|| Error::validation_for(&name, "artifact has no UID"))?;
        let hash = [json!(uid)];
        Ok(Self {
            pvc: derive_name(&[&name, COMPONENT_CACHE], &hash, MAX_NAME_LENGTH)?,
            check_size_job: derive_name(&[&name, COMPONENT_CHECK_SIZE], &hash, MAX_NAME_LENGTH)?,
            download_job: derive_name(&[&name, COMPONENT_DOWNLOAD], &hash, MAX_NAME_LENGTH)?,
        })
    }
}
