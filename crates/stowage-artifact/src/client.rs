//! Kubernetes access for the artifact controller
//!
//! Every read is a single point read; "not found" is `Ok(None)` rather than
//! an error so the engine can treat absence as a normal observation.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams, LogParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use stowage_common::crd::{Artifact, ArtifactStatus, ClusterRuntimeConfig, RuntimeConfig};
use stowage_common::kube_utils::{patch_resource_status, LABEL_JOB_NAME};
use stowage_common::{Error, FIELD_MANAGER};

/// Trait abstracting the Kubernetes operations the artifact controller needs
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactClient: Send + Sync {
    /// Get a namespaced RuntimeConfig
    async fn get_runtime_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RuntimeConfig>, Error>;

    /// Get a ClusterRuntimeConfig
    async fn get_cluster_runtime_config(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRuntimeConfig>, Error>;

    /// Get a PersistentVolumeClaim
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Get a StorageClass
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error>;

    /// Get a Job
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error>;

    /// List the pods created for a Job (by the `job-name` label)
    async fn list_job_pods(&self, namespace: &str, job_name: &str) -> Result<Vec<Pod>, Error>;

    /// Last `lines` lines of a container log.
    ///
    /// Never fails: an unavailable log stream yields an empty string.
    async fn tail_log(&self, namespace: &str, pod: &str, container: &str, lines: i64) -> String;

    /// Create a PersistentVolumeClaim
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), Error>;

    /// Create a Job
    async fn create_job(&self, job: &Job) -> Result<(), Error>;

    /// Merge-patch the status subresource of an Artifact
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ArtifactStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeArtifactClient {
    client: Client,
}

impl KubeArtifactClient {
    /// Create a new KubeArtifactClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_namespaced<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_cluster<K>(&self, name: &str) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = k8s_openapi::ClusterResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    fn namespace_of<K: Resource>(obj: &K) -> Result<String, Error> {
        obj.meta()
            .namespace
            .clone()
            .ok_or_else(|| Error::validation("object to create has no namespace"))
    }
}

#[async_trait]
impl ArtifactClient for KubeArtifactClient {
    async fn get_runtime_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RuntimeConfig>, Error> {
        self.get_namespaced(namespace, name).await
    }

    async fn get_cluster_runtime_config(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRuntimeConfig>, Error> {
        self.get_cluster(name).await
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        self.get_namespaced(namespace, name).await
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error> {
        self.get_cluster(name).await
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        self.get_namespaced(namespace, name).await
    }

    async fn list_job_pods(&self, namespace: &str, job_name: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{LABEL_JOB_NAME}={job_name}"));
        Ok(api.list(&lp).await?.items)
    }

    async fn tail_log(&self, namespace: &str, pod: &str, container: &str, lines: i64) -> String {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines: Some(lines),
            ..Default::default()
        };
        match api.logs(pod, &params).await {
            Ok(log) => log,
            Err(e) => {
                debug!(pod, container, error = %e, "log unavailable");
                String::new()
            }
        }
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), Error> {
        let namespace = Self::namespace_of(pvc)?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), pvc).await?;
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<(), Error> {
        let namespace = Self::namespace_of(job)?;
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), job).await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ArtifactStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<Artifact>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }
}
