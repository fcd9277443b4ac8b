//! Small helpers over kube-rs shared by Stowage controllers

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};

use crate::naming::sanitize;

/// Standard label naming the managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on objects created by Stowage
pub const MANAGED_BY_VALUE: &str = "stowage";

/// Label carrying the owning artifact's name
pub const LABEL_ARTIFACT: &str = "stowage.dev/artifact";

/// Label naming the role of a generated object (cache, check-size, download)
pub const LABEL_COMPONENT: &str = "stowage.dev/component";

/// Label the Job controller puts on the pods it creates
pub const LABEL_JOB_NAME: &str = "job-name";

/// Labels stamped on every object created on behalf of an artifact.
///
/// The artifact name is sanitized so it is always a valid label value.
pub fn managed_labels(artifact_name: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
        (LABEL_ARTIFACT.to_string(), sanitize(artifact_name)),
        (LABEL_COMPONENT.to_string(), component.to_string()),
    ])
}

/// Controller owner reference pointing at `owner`.
///
/// Returns `None` when the owner has no UID yet (never persisted).
pub fn controller_owner_ref<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    Some(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.uid()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Merge-patch body replacing `status`.
///
/// Fields `status` serializes as `null` are removed on the server.
pub fn status_patch(status: &impl serde::Serialize) -> serde_json::Value {
    serde_json::json!({ "status": status })
}

/// Patch the status sub-resource of a namespaced resource.
///
/// Applies [`status_patch`] via merge-patch.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = status_patch(status);
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        Artifact, ArtifactSpec, ArtifactState, ArtifactStatus, FailureCategory, FailureDetail,
    };
    use serde_json::Value;

    /// RFC 7386 merge, as the API server applies a merge-patch
    fn merge(target: &mut Value, patch: &Value) {
        match (target, patch) {
            (Value::Object(target), Value::Object(patch)) => {
                for (key, value) in patch {
                    if value.is_null() {
                        target.remove(key);
                    } else {
                        merge(target.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
            (target, patch) => *target = patch.clone(),
        }
    }

    /// Story: a download fails, the failed Job is cleaned up and a retry
    /// starts. The stored failure detail must disappear with the next patch.
    #[test]
    fn story_status_patch_clears_stale_failure_detail() {
        let failed = ArtifactStatus {
            status: ArtifactState::Failed,
            failure_detail: Some(FailureDetail {
                category: FailureCategory::Auth,
                message: "401".to_string(),
            }),
            ..Default::default()
        };
        let mut stored = serde_json::json!({ "status": failed });

        let retrying = ArtifactStatus {
            status: ArtifactState::Progressing,
            ..Default::default()
        };
        let patch = status_patch(&retrying);
        assert_eq!(patch["status"].get("failureDetail"), Some(&Value::Null));

        merge(&mut stored, &patch);
        assert!(stored["status"].get("failureDetail").is_none());

        let read_back: ArtifactStatus = serde_json::from_value(stored["status"].clone()).unwrap();
        assert_eq!(read_back, retrying);
    }

    #[test]
    fn owner_ref_requires_uid() {
        let mut artifact = Artifact::new("llama", ArtifactSpec::default());
        assert!(controller_owner_ref(&artifact).is_none());

        artifact.metadata.uid = Some("uid-1".to_string());
        let owner = controller_owner_ref(&artifact).unwrap();
        assert_eq!(owner.api_version, "stowage.dev/v1alpha1");
        assert_eq!(owner.kind, "Artifact");
        assert_eq!(owner.name, "llama");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.block_owner_deletion, Some(true));
    }

    #[test]
    fn managed_labels_identify_owner_and_role() {
        let labels = managed_labels("llama", "download");
        assert_eq!(labels.get(LABEL_MANAGED_BY).map(String::as_str), Some("stowage"));
        assert_eq!(labels.get(LABEL_ARTIFACT).map(String::as_str), Some("llama"));
        assert_eq!(labels.get(LABEL_COMPONENT).map(String::as_str), Some("download"));
    }
}
