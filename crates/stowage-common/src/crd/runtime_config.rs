//! RuntimeConfig and ClusterRuntimeConfig CRDs
//!
//! Both kinds share [`RuntimeConfigCommon`]. Artifacts reference a config by
//! name; the cluster-scoped object, the namespaced object of the same name,
//! and the artifact's own overrides are layered on top of built-in defaults
//! with [`RuntimeConfigCommon::merged`].
//!
//! Merge rules, applied field by field:
//! - a set scalar in a higher layer replaces the lower value
//! - an unset (or empty string) scalar leaves the lower value alone
//! - `env` is merged by variable name, later layers winning
//! - maps (`routing.annotations`) are replaced wholesale when set

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Headroom applied to PVC requests when no layer sets one
pub const DEFAULT_PVC_HEADROOM_PERCENT: i32 = 10;

/// Upper bound for a configured headroom percent
pub const MAX_PVC_HEADROOM_PERCENT: i32 = 100;

/// Storage policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Storage class used for cache PVCs when the artifact sets none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_storage_class_name: Option<String>,

    /// Extra storage requested above the artifact size, in percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_headroom_percent: Option<i32>,
}

/// Routing policy for services that consume cached artifacts
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Whether HTTP routes are generated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Template for the route path prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_template: Option<String>,

    /// Request timeout as a duration string (e.g. "60s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<String>,

    /// Annotations added to generated routes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Model policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Whether models are discovered automatically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_discovery: Option<bool>,
}

/// Configuration shared by RuntimeConfig and ClusterRuntimeConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfigCommon {
    /// Storage policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,

    /// Routing policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingConfig>,

    /// Model policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,

    /// Environment for download containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Deprecated: use `storage.defaultStorageClassName`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_storage_class_name: Option<String>,

    /// Deprecated: use `storage.pvcHeadroomPercent`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_headroom_percent: Option<i32>,
}

/// Namespaced runtime configuration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "stowage.dev",
    version = "v1alpha1",
    kind = "RuntimeConfig",
    plural = "runtimeconfigs",
    shortname = "rc",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfigSpec {
    /// Shared configuration
    #[serde(flatten)]
    pub common: RuntimeConfigCommon,
}

/// Cluster-scoped runtime configuration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "stowage.dev",
    version = "v1alpha1",
    kind = "ClusterRuntimeConfig",
    plural = "clusterruntimeconfigs",
    shortname = "crc"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRuntimeConfigSpec {
    /// Shared configuration
    #[serde(flatten)]
    pub common: RuntimeConfigCommon,
}

fn non_empty(value: &Option<String>) -> Option<&String> {
    value.as_ref().filter(|s| !s.is_empty())
}

fn overlay_string(target: &mut Option<String>, value: &Option<String>) {
    if let Some(v) = non_empty(value) {
        *target = Some(v.clone());
    }
}

fn overlay<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
    if let Some(v) = value {
        *target = Some(v.clone());
    }
}

impl StorageConfig {
    fn merge_from(&mut self, other: &StorageConfig) {
        overlay_string(
            &mut self.default_storage_class_name,
            &other.default_storage_class_name,
        );
        overlay(&mut self.pvc_headroom_percent, &other.pvc_headroom_percent);
    }
}

impl RoutingConfig {
    fn merge_from(&mut self, other: &RoutingConfig) {
        overlay(&mut self.enabled, &other.enabled);
        overlay_string(&mut self.path_template, &other.path_template);
        overlay_string(&mut self.request_timeout, &other.request_timeout);
        overlay(&mut self.annotations, &other.annotations);
    }
}

impl ModelConfig {
    fn merge_from(&mut self, other: &ModelConfig) {
        overlay(&mut self.auto_discovery, &other.auto_discovery);
    }
}

fn merge_section<T: Clone + Default>(
    target: &mut Option<T>,
    other: &Option<T>,
    merge: impl FnOnce(&mut T, &T),
) {
    if let Some(other) = other {
        merge(target.get_or_insert_with(T::default), other);
    }
}

impl RuntimeConfigCommon {
    /// Built-in lowest-precedence layer
    pub fn system_defaults() -> Self {
        Self {
            storage: Some(StorageConfig {
                default_storage_class_name: None,
                pvc_headroom_percent: Some(DEFAULT_PVC_HEADROOM_PERCENT),
            }),
            model: Some(ModelConfig {
                auto_discovery: Some(true),
            }),
            ..Default::default()
        }
    }

    /// Copy deprecated flat fields into `storage` where it is unset.
    ///
    /// Idempotent; the flat fields are left in place.
    pub fn migrate_deprecated_fields(&mut self) {
        if self.default_storage_class_name.is_none() && self.pvc_headroom_percent.is_none() {
            return;
        }
        let storage = self.storage.get_or_insert_with(StorageConfig::default);
        if non_empty(&storage.default_storage_class_name).is_none() {
            if let Some(sc) = non_empty(&self.default_storage_class_name) {
                storage.default_storage_class_name = Some(sc.clone());
            }
        }
        if storage.pvc_headroom_percent.is_none() {
            storage.pvc_headroom_percent = self.pvc_headroom_percent;
        }
    }

    /// Overlay `other` onto `self` using the field-level merge rules
    pub fn merge_from(&mut self, other: &RuntimeConfigCommon) {
        let mut other = other.clone();
        other.migrate_deprecated_fields();

        merge_section(&mut self.storage, &other.storage, StorageConfig::merge_from);
        merge_section(&mut self.routing, &other.routing, RoutingConfig::merge_from);
        merge_section(&mut self.model, &other.model, ModelConfig::merge_from);
        self.env = merge_env(&self.env, &other.env);
    }

    /// Merge layers ordered from lowest to highest precedence
    pub fn merged<'a>(layers: impl IntoIterator<Item = &'a RuntimeConfigCommon>) -> Self {
        let mut acc = Self::default();
        for layer in layers {
            acc.merge_from(layer);
        }
        acc
    }

    /// Storage class to use for new PVCs, if any
    pub fn storage_class_name(&self) -> Option<&str> {
        self.storage
            .as_ref()
            .and_then(|s| non_empty(&s.default_storage_class_name))
            .map(String::as_str)
    }

    /// PVC headroom percent, defaulted and clamped to `[0, 100]`
    pub fn pvc_headroom_percent(&self) -> i32 {
        self.storage
            .as_ref()
            .and_then(|s| s.pvc_headroom_percent)
            .unwrap_or(DEFAULT_PVC_HEADROOM_PERCENT)
            .clamp(0, MAX_PVC_HEADROOM_PERCENT)
    }

    /// Whether model auto-discovery is enabled (default true)
    pub fn auto_discovery(&self) -> bool {
        self.model
            .as_ref()
            .and_then(|m| m.auto_discovery)
            .unwrap_or(true)
    }
}

/// Merge two env lists by name.
///
/// Entries in `overrides` replace same-named entries in `base` in place;
/// new names are appended in `overrides` order. Names are never duplicated.
pub fn merge_env(base: &[EnvVar], overrides: &[EnvVar]) -> Vec<EnvVar> {
    let mut out: Vec<EnvVar> = Vec::with_capacity(base.len() + overrides.len());
    for var in base.iter().chain(overrides) {
        match out.iter_mut().find(|e| e.name == var.name) {
            Some(existing) => *existing = var.clone(),
            None => out.push(var.clone()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    fn value_of<'a>(vars: &'a [EnvVar], name: &str) -> Option<&'a str> {
        vars.iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    fn with_storage(class: Option<&str>, headroom: Option<i32>) -> RuntimeConfigCommon {
        RuntimeConfigCommon {
            storage: Some(StorageConfig {
                default_storage_class_name: class.map(str::to_string),
                pvc_headroom_percent: headroom,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn higher_layer_scalar_wins() {
        let cluster = with_storage(None, Some(10));
        let namespace = with_storage(None, Some(20));
        let merged = RuntimeConfigCommon::merged([&cluster, &namespace]);
        assert_eq!(merged.pvc_headroom_percent(), 20);
    }

    #[test]
    fn absent_field_does_not_clobber_lower_layer() {
        let cluster = with_storage(Some("cluster-sc"), Some(10));
        let namespace = with_storage(None, Some(20));
        let merged = RuntimeConfigCommon::merged([&cluster, &namespace]);
        assert_eq!(merged.storage_class_name(), Some("cluster-sc"));
        assert_eq!(merged.pvc_headroom_percent(), 20);
    }

    #[test]
    fn empty_string_does_not_clobber_lower_layer() {
        let cluster = with_storage(Some("cluster-sc"), None);
        let namespace = with_storage(Some(""), None);
        let merged = RuntimeConfigCommon::merged([&cluster, &namespace]);
        assert_eq!(merged.storage_class_name(), Some("cluster-sc"));
    }

    #[test]
    fn env_is_merged_by_name() {
        let merged = merge_env(
            &[env("CLUSTER", "c"), env("SHARED", "c2")],
            &[env("NS", "n"), env("SHARED", "n2")],
        );
        assert_eq!(merged.len(), 3);
        assert_eq!(value_of(&merged, "CLUSTER"), Some("c"));
        assert_eq!(value_of(&merged, "NS"), Some("n"));
        assert_eq!(value_of(&merged, "SHARED"), Some("n2"));
    }

    #[test]
    fn env_layers_merge_through_config() {
        let cluster = RuntimeConfigCommon {
            env: vec![env("HF_HOME", "/a"), env("TOKEN", "x")],
            ..Default::default()
        };
        let namespace = RuntimeConfigCommon {
            env: vec![env("HF_HOME", "/b")],
            ..Default::default()
        };
        let merged = RuntimeConfigCommon::merged([&cluster, &namespace]);
        assert_eq!(value_of(&merged.env, "HF_HOME"), Some("/b"));
        assert_eq!(value_of(&merged.env, "TOKEN"), Some("x"));
    }

    #[test]
    fn annotations_are_replaced_wholesale() {
        let cluster = RuntimeConfigCommon {
            routing: Some(RoutingConfig {
                enabled: Some(true),
                annotations: Some(BTreeMap::from([
                    ("a".to_string(), "1".to_string()),
                    ("b".to_string(), "2".to_string()),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let namespace = RuntimeConfigCommon {
            routing: Some(RoutingConfig {
                annotations: Some(BTreeMap::from([("c".to_string(), "3".to_string())])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = RuntimeConfigCommon::merged([&cluster, &namespace]);
        let routing = merged.routing.unwrap();
        assert_eq!(routing.enabled, Some(true));
        let annotations = routing.annotations.unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations.get("c").map(String::as_str), Some("3"));
    }

    #[test]
    fn deprecated_fields_migrate_only_when_grouped_unset() {
        let mut legacy = RuntimeConfigCommon {
            default_storage_class_name: Some("legacy-sc".to_string()),
            pvc_headroom_percent: Some(30),
            ..Default::default()
        };
        legacy.migrate_deprecated_fields();
        assert_eq!(legacy.storage_class_name(), Some("legacy-sc"));
        assert_eq!(legacy.pvc_headroom_percent(), 30);

        let mut both = RuntimeConfigCommon {
            default_storage_class_name: Some("legacy-sc".to_string()),
            ..with_storage(Some("new-sc"), None)
        };
        both.migrate_deprecated_fields();
        both.migrate_deprecated_fields();
        assert_eq!(both.storage_class_name(), Some("new-sc"));
    }

    #[test]
    fn deprecated_fields_take_part_in_merge() {
        let cluster = with_storage(Some("cluster-sc"), None);
        let namespace = RuntimeConfigCommon {
            default_storage_class_name: Some("ns-legacy".to_string()),
            ..Default::default()
        };
        let merged = RuntimeConfigCommon::merged([&cluster, &namespace]);
        assert_eq!(merged.storage_class_name(), Some("ns-legacy"));
    }

    #[test]
    fn system_defaults_apply_when_nothing_else_is_set() {
        let defaults = RuntimeConfigCommon::system_defaults();
        let merged = RuntimeConfigCommon::merged([&defaults]);
        assert_eq!(merged.pvc_headroom_percent(), DEFAULT_PVC_HEADROOM_PERCENT);
        assert!(merged.auto_discovery());
        assert_eq!(merged.storage_class_name(), None);
    }

    #[test]
    fn headroom_is_clamped() {
        assert_eq!(with_storage(None, Some(500)).pvc_headroom_percent(), 100);
        assert_eq!(with_storage(None, Some(-3)).pvc_headroom_percent(), 0);
    }

    #[test]
    fn flattened_spec_deserializes() {
        let spec: RuntimeConfigSpec = serde_json::from_value(serde_json::json!({
            "storage": {"defaultStorageClassName": "fast"},
            "env": [{"name": "A", "value": "1"}]
        }))
        .unwrap();
        assert_eq!(spec.common.storage_class_name(), Some("fast"));
        assert_eq!(spec.common.env.len(), 1);
    }
}
