//! The `Platform` custom resource.

use std::collections::BTreeMap;
use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionKind, PlatformState};
use crate::status::ComponentStatus;

/// Desired state of the whole platform.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "Platform",
    namespaced,
    status = "PlatformStatus",
    shortname = "kplat",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.available"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSpec {
    /// Desired platform version; empty means "whatever the operator ships".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_name: Option<String>,
    /// Per-component toggles and overrides, keyed by component name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ComponentToggle>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    Dev,
    #[default]
    Prod,
    ManagedCluster,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Dev => "dev",
            Profile::Prod => "prod",
            Profile::ManagedCluster => "managed-cluster",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentToggle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Re-apply the component when the resource generation changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_changes: Option<bool>,
    /// Free-form values handed to the component installer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PlatformState>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentStatus>,
    /// Generation the platform last fully converged at.
    #[serde(default)]
    pub observed_generation: i64,
    /// Last retry annotation value acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_retry: Option<String>,
    /// "ready/enabled" component summary maintained by the availability poller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceInfo>,
}

impl PlatformStatus {
    /// True once an InstallComplete condition has ever been recorded.
    pub fn is_install_complete(&self) -> bool {
        self.conditions.iter().any(|c| c.kind == ConditionKind::InstallComplete)
    }

    pub fn last_condition(&self) -> Option<&Condition> {
        self.conditions.last()
    }
}

/// Endpoint URLs published by components once the platform is up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    #[serde(default)]
    pub urls: BTreeMap<String, String>,
}

/// Identity of a `Platform` object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl Platform {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == crate::FINALIZER)
    }

    pub fn retry_token(&self) -> Option<&str> {
        self.annotations().get(crate::RETRY_ANNOTATION).map(String::as_str)
    }

    pub fn state(&self) -> Option<PlatformState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn status_mut(&mut self) -> &mut PlatformStatus {
        self.status.get_or_insert_with(PlatformStatus::default)
    }
}
