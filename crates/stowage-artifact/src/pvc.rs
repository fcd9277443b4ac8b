//! Cache PVC construction and inspection

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use stowage_common::crd::Artifact;
use stowage_common::kube_utils::{controller_owner_ref, managed_labels};
use stowage_common::quantity::storage_with_headroom;
use stowage_common::{Error, Result};

use crate::names::COMPONENT_CACHE;

/// Access mode of the cache PVC; download and serving pods share it
pub const CACHE_ACCESS_MODE: &str = "ReadWriteMany";

/// PVC phase reported once a volume is bound
pub const PHASE_BOUND: &str = "Bound";
/// PVC phase while waiting for a volume
pub const PHASE_PENDING: &str = "Pending";
/// PVC phase after the bound volume disappeared
pub const PHASE_LOST: &str = "Lost";

/// Volume binding mode that defers binding until a pod is scheduled
pub const WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";

/// Build the cache PVC for `artifact`.
///
/// The request is `size_bytes` plus `headroom_percent`, written as a plain
/// byte quantity. `storageClassName` is only set when non-empty so the
/// cluster default applies otherwise.
pub fn build_cache_pvc(
    artifact: &Artifact,
    pvc_name: &str,
    size_bytes: i64,
    headroom_percent: i32,
    storage_class: Option<&str>,
) -> Result<PersistentVolumeClaim> {
    let name = artifact.name_any();
    let owner = controller_owner_ref(artifact)
        .ok_or_else(|| Error::validation_for(&name, "artifact has no UID"))?;
    let request = storage_with_headroom(size_bytes, headroom_percent);

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name.to_string()),
            namespace: artifact.namespace(),
            labels: Some(managed_labels(&name, COMPONENT_CACHE)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![CACHE_ACCESS_MODE.to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(request.to_string()),
                )])),
                ..Default::default()
            }),
            storage_class_name: storage_class
                .filter(|sc| !sc.is_empty())
                .map(str::to_string),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Phase reported in the PVC status, if any
pub fn pvc_phase(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Storage class named in the PVC spec, if non-empty
pub fn pvc_storage_class(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.storage_class_name.as_deref())
        .filter(|s| !s.is_empty())
}

/// The `storage` request of the PVC spec
pub fn pvc_requested_storage(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
}

/// True when the storage class defers binding to the first consuming pod
pub fn is_wait_for_first_consumer(sc: &StorageClass) -> bool {
    sc.volume_binding_mode.as_deref() == Some(WAIT_FOR_FIRST_CONSUMER)
}
