use std::path::Path;

use anyhow::{Context, Result};
use keel_core::SemVersion;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ConfigError;

const EMBEDDED: &str = include_str!("../manifest/platform.yaml");

/// Bill of materials: the platform version this operator ships and the
/// ordered list of components with their charts and versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    #[serde(default)]
    pub shared_namespaces: Vec<String>,
    pub components: Vec<ManifestComponent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestComponent {
    pub name: String,
    pub namespace: String,
    pub chart: String,
    pub version: String,
    /// Helm release name; defaults to the component name.
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub min_version: Option<String>,
    #[serde(default)]
    pub deployments: Vec<String>,
    #[serde(default = "yes")]
    pub enabled_by_default: bool,
    #[serde(default = "yes")]
    pub install_supported: bool,
    #[serde(default)]
    pub registers_local_cluster: bool,
    /// Host prefix of the component's public endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn yes() -> bool { true }

impl ManifestComponent {
    pub fn release(&self) -> &str {
        self.release.as_deref().unwrap_or(&self.name)
    }
}

impl Manifest {
    /// The manifest compiled into the binary.
    pub fn embedded() -> Result<Self> {
        Self::from_yaml(EMBEDDED).context("parsing embedded manifest")
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        let m: Manifest = serde_yaml::from_str(s)?;
        m.validate()?;
        Ok(m)
    }

    /// Load from `path` (YAML or JSON) or fall back to the embedded manifest.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let m = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).with_context(|| format!("reading manifest {}", p.display()))?;
                Self::from_yaml(&raw).with_context(|| format!("parsing manifest {}", p.display()))?
            }
            None => Self::embedded()?,
        };
        info!(version = %m.version, components = m.components.len(), "manifest: loaded");
        Ok(m)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        SemVersion::parse(&self.version).map_err(|e| ConfigError::Manifest(format!("version: {e}")))?;
        for c in &self.components {
            if let Some(mv) = &c.min_version {
                SemVersion::parse(mv).map_err(|e| ConfigError::Manifest(format!("{}: minVersion: {e}", c.name)))?;
            }
        }
        Ok(())
    }

    pub fn semver(&self) -> Result<SemVersion, ConfigError> {
        SemVersion::parse(&self.version).map_err(|e| ConfigError::Manifest(e.to_string()))
    }

    pub fn component(&self, name: &str) -> Option<&ManifestComponent> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn component_version(&self, name: &str) -> Option<&str> {
        self.component(name).map(|c| c.version.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_manifest_is_valid() {
        let m = Manifest::embedded().unwrap();
        assert_eq!(m.components.len(), 17);
        assert!(m.semver().is_ok());
        let rancher = m.component("cluster-manager").unwrap();
        assert!(rancher.registers_local_cluster);
        assert_eq!(rancher.release(), "cluster-manager");
        assert!(!m.component("backup").unwrap().enabled_by_default);
        assert_eq!(m.component_version("cert-manager"), Some("1.13.3"));
    }

    #[test]
    fn rejects_bad_versions() {
        let bad = "version: one\ncomponents: []\n";
        assert!(Manifest::from_yaml(bad).is_err());
        let bad_min = "version: 1.0.0\ncomponents:\n  - {name: a, namespace: a, chart: x/a, version: 1.0.0, minVersion: nope}\n";
        assert!(Manifest::from_yaml(bad_min).is_err());
    }

    #[test]
    fn accepts_json() {
        let json = r#"{"version":"2.0.0","components":[{"name":"a","namespace":"a","chart":"x/a","version":"0.1.0"}]}"#;
        let m = Manifest::from_yaml(json).unwrap();
        assert!(m.components[0].enabled_by_default);
        assert!(m.shared_namespaces.is_empty());
    }
}
