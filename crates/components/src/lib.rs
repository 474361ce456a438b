//! Keel components: every manifest entry becomes a chart-backed component.

#![forbid(unsafe_code)]

use std::sync::Arc;

use keel_catalog::{Catalog, Component, ComponentContext, HookError};
use keel_config::{ManifestComponent, Manifest, Settings};
use keel_core::{PlatformSpec, SemVersion};
use tracing::{debug, info, warn};

pub mod helm;

pub use helm::{ChartBackend, ChartError, HelmBackend};

impl From<ChartError> for HookError {
    fn from(e: ChartError) -> Self {
        match e {
            ChartError::Kube(_) | ChartError::Spawn(_) => HookError::Retryable(e.to_string()),
            other => HookError::failed(other),
        }
    }
}

/// A component installed from a helm chart pinned by the manifest.
pub struct ChartComponent {
    spec: ManifestComponent,
    min_version: Option<SemVersion>,
    backend: Arc<dyn ChartBackend>,
    dns_suffix: String,
}

impl ChartComponent {
    pub fn new(spec: ManifestComponent, backend: Arc<dyn ChartBackend>, dns_suffix: impl Into<String>) -> Self {
        let min_version = spec.min_version.as_deref().and_then(|v| SemVersion::parse(v).ok());
        Self { spec, min_version, backend, dns_suffix: dns_suffix.into() }
    }

    fn values(&self, ctx: &ComponentContext<'_>) -> serde_json::Value {
        ctx.overrides(&self.spec.name).cloned().unwrap_or_else(|| serde_json::json!({}))
    }

    async fn apply(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError> {
        if ctx.dry_run {
            info!(component = %self.spec.name, op = %ctx.operation, "dry run: chart not applied");
            return Ok(());
        }
        let values = self.values(ctx);
        self.backend
            .upgrade_install(self.spec.release(), &self.spec.chart, &self.spec.version, &self.spec.namespace, &values)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Component for ChartComponent {
    fn name(&self) -> &str { &self.spec.name }
    fn namespace(&self) -> &str { &self.spec.namespace }
    fn dependencies(&self) -> &[String] { &self.spec.dependencies }
    fn min_version(&self) -> Option<&SemVersion> { self.min_version.as_ref() }

    fn is_enabled(&self, effective: &PlatformSpec) -> bool {
        effective.components.get(&self.spec.name).and_then(|t| t.enabled).unwrap_or(self.spec.enabled_by_default)
    }

    fn operator_install_supported(&self) -> bool { self.spec.install_supported }
    fn registers_local_cluster(&self) -> bool { self.spec.registers_local_cluster }

    /// Any release counts, whatever its status; a failed or pending one is
    /// still there to upgrade, recover or remove.
    async fn is_installed(&self, _ctx: &ComponentContext<'_>) -> Result<bool, HookError> {
        let status = self.backend.release_status(self.spec.release(), &self.spec.namespace).await?;
        Ok(status.is_some())
    }

    async fn is_ready(&self, ctx: &ComponentContext<'_>) -> bool {
        if ctx.dry_run {
            return true;
        }
        match self.backend.release_status(self.spec.release(), &self.spec.namespace).await {
            Ok(Some(status)) if status == "deployed" => {
                self.backend.deployments_ready(&self.spec.namespace, &self.spec.deployments).await
            }
            Ok(_) => false,
            Err(e) => {
                debug!(component = %self.spec.name, error = %e, "readiness check failed");
                false
            }
        }
    }

    async fn install(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError> {
        self.apply(ctx).await
    }

    async fn upgrade(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError> {
        self.apply(ctx).await
    }

    async fn uninstall(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError> {
        if ctx.dry_run {
            info!(component = %self.spec.name, "dry run: release kept");
            return Ok(());
        }
        self.backend.uninstall(self.spec.release(), &self.spec.namespace).await?;
        Ok(())
    }

    async fn resolve_pending(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError> {
        if ctx.dry_run {
            return Ok(());
        }
        let n = self.backend.clear_pending(self.spec.release(), &self.spec.namespace).await?;
        if n > 0 {
            warn!(component = %self.spec.name, cleared = n, "cleared pending release records");
        }
        Ok(())
    }

    async fn endpoint(&self, ctx: &ComponentContext<'_>) -> Option<String> {
        let prefix = self.spec.endpoint.as_deref()?;
        let env = ctx.effective.environment_name.as_deref().filter(|e| !e.is_empty()).unwrap_or("default");
        Some(format!("https://{prefix}.{env}.{}", self.dns_suffix))
    }
}

/// One chart component per manifest entry, in manifest order.
pub fn build_catalog(manifest: &Manifest, backend: Arc<dyn ChartBackend>, settings: &Settings) -> Catalog {
    let components = manifest
        .components
        .iter()
        .map(|c| Arc::new(ChartComponent::new(c.clone(), backend.clone(), settings.dns_suffix.clone())) as Arc<dyn Component>)
        .collect();
    Catalog::new(components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use keel_catalog::Operation;
    use keel_core::{ComponentToggle, Platform};

    #[derive(Default)]
    struct Recorder {
        status: Mutex<Option<String>>,
        ready: Mutex<bool>,
        applied: Mutex<Vec<(String, String, serde_json::Value)>>,
        removed: Mutex<Vec<String>>,
        cleared: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl ChartBackend for Recorder {
        async fn release_status(&self, _release: &str, _namespace: &str) -> Result<Option<String>, ChartError> {
            Ok(self.status.lock().unwrap().clone())
        }

        async fn upgrade_install(
            &self,
            release: &str,
            _chart: &str,
            version: &str,
            _namespace: &str,
            values: &serde_json::Value,
        ) -> Result<(), ChartError> {
            self.applied.lock().unwrap().push((release.to_string(), version.to_string(), values.clone()));
            *self.status.lock().unwrap() = Some("deployed".into());
            Ok(())
        }

        async fn uninstall(&self, release: &str, _namespace: &str) -> Result<(), ChartError> {
            self.removed.lock().unwrap().push(release.to_string());
            *self.status.lock().unwrap() = None;
            Ok(())
        }

        async fn deployments_ready(&self, _namespace: &str, _names: &[String]) -> bool {
            *self.ready.lock().unwrap()
        }

        async fn clear_pending(&self, _release: &str, _namespace: &str) -> Result<usize, ChartError> {
            *self.cleared.lock().unwrap() += 1;
            Ok(2)
        }
    }

    fn component(backend: Arc<Recorder>) -> ChartComponent {
        let m = Manifest::embedded().unwrap();
        ChartComponent::new(m.component("search-dashboards").unwrap().clone(), backend, "nip.io")
    }

    #[tokio::test]
    async fn install_applies_overrides_and_reports_installed() {
        let backend = Arc::new(Recorder::default());
        let c = component(backend.clone());
        let mut spec = PlatformSpec::default();
        spec.components.insert(
            "search-dashboards".into(),
            ComponentToggle { overrides: Some(serde_json::json!({"replicas": 3})), ..Default::default() },
        );
        let platform = Platform::new("p", spec.clone());
        let ctx = ComponentContext::new(&platform, &spec, Operation::Install, false);

        assert!(!c.is_installed(&ctx).await.unwrap());
        c.install(&ctx).await.unwrap();
        assert!(c.is_installed(&ctx).await.unwrap());
        let applied = backend.applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].2["replicas"], 3);

        assert!(!c.is_ready(&ctx).await);
        *backend.ready.lock().unwrap() = true;
        assert!(c.is_ready(&ctx).await);
    }

    #[tokio::test]
    async fn failed_or_pending_release_counts_as_installed() {
        let backend = Arc::new(Recorder::default());
        *backend.ready.lock().unwrap() = true;
        let c = component(backend.clone());
        let spec = PlatformSpec::default();
        let platform = Platform::new("p", spec.clone());
        let ctx = ComponentContext::new(&platform, &spec, Operation::Upgrade, false);
        for status in ["failed", "pending-upgrade", "pending-install"] {
            *backend.status.lock().unwrap() = Some(status.into());
            assert!(c.is_installed(&ctx).await.unwrap(), "{status}");
            assert!(!c.is_ready(&ctx).await, "{status}");
        }
        c.resolve_pending(&ctx).await.unwrap();
        assert_eq!(*backend.cleared.lock().unwrap(), 1);

        *backend.status.lock().unwrap() = Some("deployed".into());
        assert!(c.is_ready(&ctx).await);
        *backend.status.lock().unwrap() = None;
        assert!(!c.is_installed(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let backend = Arc::new(Recorder::default());
        let c = component(backend.clone());
        let spec = PlatformSpec::default();
        let platform = Platform::new("p", spec.clone());
        let ctx = ComponentContext::new(&platform, &spec, Operation::Install, true);
        c.install(&ctx).await.unwrap();
        c.uninstall(&ctx).await.unwrap();
        c.resolve_pending(&ctx).await.unwrap();
        assert!(backend.applied.lock().unwrap().is_empty());
        assert!(backend.removed.lock().unwrap().is_empty());
        assert_eq!(*backend.cleared.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn endpoint_uses_environment_name() {
        let c = component(Arc::new(Recorder::default()));
        let mut spec = PlatformSpec::default();
        let platform = Platform::new("p", spec.clone());
        let ctx = ComponentContext::new(&platform, &spec, Operation::Probe, false);
        assert_eq!(c.endpoint(&ctx).await.as_deref(), Some("https://osd.default.nip.io"));
        spec.environment_name = Some("lab".into());
        let ctx = ComponentContext::new(&platform, &spec, Operation::Probe, false);
        assert_eq!(c.endpoint(&ctx).await.as_deref(), Some("https://osd.lab.nip.io"));
    }

    #[test]
    fn embedded_manifest_builds_a_sound_catalog() {
        let m = Manifest::embedded().unwrap();
        let catalog = build_catalog(&m, Arc::new(Recorder::default()), &Settings::default());
        assert_eq!(catalog.len(), m.components.len());
        assert!(catalog.defects().is_empty());
        for c in catalog.components() {
            assert!(catalog.check_dependencies(c.name()), "{}", c.name());
        }
        let tracing = catalog.find("tracing").unwrap();
        assert_eq!(tracing.min_version().map(|v| v.to_string()).as_deref(), Some("1.3.0"));
    }
}
