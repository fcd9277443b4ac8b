//! Runtime config resolution for an artifact
//!
//! Looks up the ClusterRuntimeConfig and the namespaced RuntimeConfig of the
//! requested name and layers them, with the artifact's inline overrides on
//! top, over the built-in defaults.

use kube::ResourceExt;
use tracing::debug;

use stowage_common::crd::{
    condition_types, Artifact, Condition, ConditionStatus, RuntimeConfigCommon, StorageConfig,
    DEFAULT_RUNTIME_CONFIG_NAME,
};
use stowage_common::Error;

use crate::client::ArtifactClient;

/// Condition reasons for `RuntimeConfigResolved`
pub mod reasons {
    /// At least one config layer of the requested name exists
    pub const RESOLVED: &str = "Resolved";
    /// The `default` config does not exist anywhere; built-in defaults apply
    pub const USING_DEFAULTS: &str = "UsingDefaults";
    /// An explicitly named config does not exist anywhere
    pub const CONFIG_NOT_FOUND: &str = "ConfigNotFound";
}

/// Outcome of looking up the referenced config
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigLookup {
    /// Found at cluster and/or namespace scope
    Resolved,
    /// `default` requested and absent; not an error
    UsingDefaults,
    /// A non-default name requested and absent
    NotFound,
}

/// Effective configuration for one reconcile
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedConfig {
    /// Requested config name
    pub name: String,
    /// Lookup outcome
    pub lookup: ConfigLookup,
    /// Merged configuration, artifact overrides included
    pub effective: RuntimeConfigCommon,
}

impl ResolvedConfig {
    /// True when an explicitly named config could not be found
    pub fn is_not_found(&self) -> bool {
        self.lookup == ConfigLookup::NotFound
    }

    /// Message reported for a missing config
    pub fn not_found_message(&self, namespace: &str) -> String {
        format!(
            "RuntimeConfig \"{}\" not found in namespace \"{namespace}\" or cluster scope",
            self.name
        )
    }

    /// The `RuntimeConfigResolved` condition for this lookup
    pub fn condition(&self, namespace: &str) -> Condition {
        let (status, reason, message) = match self.lookup {
            ConfigLookup::Resolved => (
                ConditionStatus::True,
                reasons::RESOLVED,
                format!("Using RuntimeConfig \"{}\"", self.name),
            ),
            ConfigLookup::UsingDefaults => (
                ConditionStatus::True,
                reasons::USING_DEFAULTS,
                "No RuntimeConfig found, using built-in defaults".to_string(),
            ),
            ConfigLookup::NotFound => (
                ConditionStatus::False,
                reasons::CONFIG_NOT_FOUND,
                self.not_found_message(namespace),
            ),
        };
        Condition::new(condition_types::RUNTIME_CONFIG_RESOLVED, status, reason, message)
    }
}

/// The artifact's inline overrides as a config layer
pub fn artifact_overrides(artifact: &Artifact) -> RuntimeConfigCommon {
    RuntimeConfigCommon {
        storage: artifact
            .spec
            .storage_class_name
            .as_ref()
            .filter(|sc| !sc.is_empty())
            .map(|sc| StorageConfig {
                default_storage_class_name: Some(sc.clone()),
                pvc_headroom_percent: None,
            }),
        env: artifact.spec.env.clone(),
        ..Default::default()
    }
}

/// Layer the looked-up configs for `artifact`.
///
/// Precedence, low to high: system defaults, cluster, namespace, artifact.
pub fn resolve_layers(
    artifact: &Artifact,
    cluster: Option<&RuntimeConfigCommon>,
    namespaced: Option<&RuntimeConfigCommon>,
) -> ResolvedConfig {
    let name = artifact.spec.runtime_config_name().to_string();
    let lookup = match (cluster, namespaced) {
        (None, None) if name == DEFAULT_RUNTIME_CONFIG_NAME => ConfigLookup::UsingDefaults,
        (None, None) => ConfigLookup::NotFound,
        _ => ConfigLookup::Resolved,
    };

    let defaults = RuntimeConfigCommon::system_defaults();
    let overrides = artifact_overrides(artifact);
    let layers = [Some(&defaults), cluster, namespaced, Some(&overrides)];
    let effective = RuntimeConfigCommon::merged(layers.into_iter().flatten());

    ResolvedConfig {
        name,
        lookup,
        effective,
    }
}

/// Fetch both config scopes and layer them for `artifact`.
///
/// API failures propagate; absence does not.
pub async fn resolve_runtime_config(
    client: &dyn ArtifactClient,
    artifact: &Artifact,
) -> Result<ResolvedConfig, Error> {
    let artifact_name = artifact.name_any();
    let namespace = artifact
        .namespace()
        .ok_or_else(|| Error::validation_for(&artifact_name, "Artifact must be namespaced"))?;
    let name = artifact.spec.runtime_config_name();

    let cluster = client.get_cluster_runtime_config(name).await?;
    let namespaced = client.get_runtime_config(&namespace, name).await?;

    debug!(
        artifact = %artifact_name,
        config = name,
        cluster = cluster.is_some(),
        namespaced = namespaced.is_some(),
        "resolved runtime config layers"
    );

    Ok(resolve_layers(
        artifact,
        cluster.as_ref().map(|c| &c.spec.common),
        namespaced.as_ref().map(|c| &c.spec.common),
    ))
}
