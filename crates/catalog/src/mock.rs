//! In-memory component for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use keel_core::{PlatformSpec, SemVersion};
use rustc_hash::FxHashSet;

use crate::component::{Component, ComponentContext, HookError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    PreInstall,
    Install,
    PostInstall,
    PreUpgrade,
    Upgrade,
    PostUpgrade,
    PreUninstall,
    Uninstall,
    PostUninstall,
    ResolvePending,
}

/// Hook calls across several mocks, in call order.
pub type Journal = Arc<Mutex<Vec<(String, Hook)>>>;

/// Scriptable component: records every hook call, installs and uninstalls
/// itself by flipping `installed`, and fails the hooks listed in `fail`.
pub struct MockComponent {
    name: String,
    namespace: String,
    deps: Vec<String>,
    min_version: Option<SemVersion>,
    enabled_by_default: bool,
    supported: bool,
    local_cluster: bool,
    endpoint: Option<String>,
    installed: AtomicBool,
    ready: AtomicBool,
    fail: Mutex<FxHashSet<Hook>>,
    check_errors: AtomicUsize,
    calls: Mutex<Vec<Hook>>,
    journal: Option<Journal>,
}

impl MockComponent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: format!("{name}-system"),
            deps: Vec::new(),
            min_version: None,
            enabled_by_default: true,
            supported: true,
            local_cluster: false,
            endpoint: None,
            installed: AtomicBool::new(false),
            ready: AtomicBool::new(true),
            fail: Mutex::new(FxHashSet::default()),
            check_errors: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            journal: None,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn min_version(mut self, v: &str) -> Self {
        self.min_version = SemVersion::parse(v).ok();
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    pub fn unsupported(mut self) -> Self {
        self.supported = false;
        self
    }

    pub fn local_cluster(mut self) -> Self {
        self.local_cluster = true;
        self
    }

    pub fn with_endpoint(mut self, url: &str) -> Self {
        self.endpoint = Some(url.to_string());
        self
    }

    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = Some(journal.clone());
        self
    }

    pub fn installed(self, on: bool) -> Self {
        self.set_installed(on);
        self
    }

    pub fn ready(self, on: bool) -> Self {
        self.set_ready(on);
        self
    }

    pub fn set_installed(&self, on: bool) { self.installed.store(on, Ordering::SeqCst) }
    pub fn set_ready(&self, on: bool) { self.ready.store(on, Ordering::SeqCst) }

    pub fn fail_on(&self, hook: Hook) {
        if let Ok(mut f) = self.fail.lock() {
            f.insert(hook);
        }
    }

    pub fn heal(&self, hook: Hook) {
        if let Ok(mut f) = self.fail.lock() {
            f.remove(&hook);
        }
    }

    /// Fail the next `n` installed checks.
    pub fn fail_installed_checks(&self, n: usize) {
        self.check_errors.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Hook> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, hook: Hook) -> usize {
        self.calls().iter().filter(|h| **h == hook).count()
    }

    fn call(&self, hook: Hook) -> Result<(), HookError> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(hook);
        }
        if let Some(Ok(mut j)) = self.journal.as_ref().map(|j| j.lock()) {
            j.push((self.name.clone(), hook));
        }
        let failing = self.fail.lock().map(|f| f.contains(&hook)).unwrap_or(false);
        if failing {
            return Err(HookError::Failed(format!("{} {:?} failed", self.name, hook)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Component for MockComponent {
    fn name(&self) -> &str { &self.name }
    fn namespace(&self) -> &str { &self.namespace }
    fn dependencies(&self) -> &[String] { &self.deps }
    fn min_version(&self) -> Option<&SemVersion> { self.min_version.as_ref() }

    fn is_enabled(&self, effective: &PlatformSpec) -> bool {
        effective.components.get(&self.name).and_then(|t| t.enabled).unwrap_or(self.enabled_by_default)
    }

    fn operator_install_supported(&self) -> bool { self.supported }
    fn registers_local_cluster(&self) -> bool { self.local_cluster }

    async fn is_installed(&self, _ctx: &ComponentContext<'_>) -> Result<bool, HookError> {
        let failing = self
            .check_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(HookError::Retryable(format!("{} installed check unavailable", self.name)));
        }
        Ok(self.installed.load(Ordering::SeqCst))
    }

    async fn is_ready(&self, _ctx: &ComponentContext<'_>) -> bool {
        self.installed.load(Ordering::SeqCst) && self.ready.load(Ordering::SeqCst)
    }

    async fn pre_install(&self, _ctx: &ComponentContext<'_>) -> Result<(), HookError> { self.call(Hook::PreInstall) }

    async fn install(&self, _ctx: &ComponentContext<'_>) -> Result<(), HookError> {
        self.call(Hook::Install)?;
        self.set_installed(true);
        Ok(())
    }

    async fn post_install(&self, _ctx: &ComponentContext<'_>) -> Result<(), HookError> { self.call(Hook::PostInstall) }
    async fn pre_upgrade(&self, _ctx: &ComponentContext<'_>) -> Result<(), HookError> { self.call(Hook::PreUpgrade) }
    async fn upgrade(&self, _ctx: &ComponentContext<'_>) -> Result<(), HookError> { self.call(Hook::Upgrade) }
    async fn post_upgrade(&self, _ctx: &ComponentContext<'_>) -> Result<(), HookError> { self.call(Hook::PostUpgrade) }
    async fn pre_uninstall(&self, _ctx: &ComponentContext<'_>) -> Result<(), HookError> { self.call(Hook::PreUninstall) }

    async fn uninstall(&self, _ctx: &ComponentContext<'_>) -> Result<(), HookError> {
        self.call(Hook::Uninstall)?;
        self.set_installed(false);
        Ok(())
    }

    async fn post_uninstall(&self, _ctx: &ComponentContext<'_>) -> Result<(), HookError> { self.call(Hook::PostUninstall) }
    async fn resolve_pending(&self, _ctx: &ComponentContext<'_>) -> Result<(), HookError> { self.call(Hook::ResolvePending) }

    async fn endpoint(&self, _ctx: &ComponentContext<'_>) -> Option<String> { self.endpoint.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Catalog, Operation};
    use keel_core::{ComponentToggle, Platform};
    use std::sync::Arc;

    #[tokio::test]
    async fn dependency_readiness_gates_dependents() {
        let cm = Arc::new(MockComponent::new("cert-manager").installed(true).ready(false));
        let ingress = Arc::new(MockComponent::new("ingress").depends_on(&["cert-manager"]));
        let catalog = Catalog::new(vec![cm.clone() as Arc<dyn Component>, ingress.clone() as Arc<dyn Component>]);
        let platform = Platform::new("p", PlatformSpec::default());
        let spec = PlatformSpec::default();
        let ctx = ComponentContext::new(&platform, &spec, Operation::Install, false);

        assert!(!catalog.dependencies_met(ingress.as_ref(), &ctx).await);
        cm.set_ready(true);
        assert!(catalog.dependencies_met(ingress.as_ref(), &ctx).await);
        assert!(catalog.dependencies_met(cm.as_ref(), &ctx).await);
    }

    #[tokio::test]
    async fn disabled_dependency_still_has_to_be_ready() {
        let dep = Arc::new(MockComponent::new("dep"));
        let top = Arc::new(MockComponent::new("top").depends_on(&["dep"]));
        let catalog = Catalog::new(vec![dep.clone() as Arc<dyn Component>, top.clone() as Arc<dyn Component>]);
        let mut spec = PlatformSpec::default();
        spec.components.insert("dep".into(), ComponentToggle { enabled: Some(false), ..Default::default() });
        let platform = Platform::new("p", spec.clone());
        let ctx = ComponentContext::new(&platform, &spec, Operation::Install, false);
        assert!(!catalog.dependencies_met(top.as_ref(), &ctx).await);
    }

    #[tokio::test]
    async fn hooks_are_recorded_and_failures_injected() {
        let m = MockComponent::new("a");
        let platform = Platform::new("p", PlatformSpec::default());
        let spec = PlatformSpec::default();
        let ctx = ComponentContext::new(&platform, &spec, Operation::Install, false);
        m.fail_on(Hook::Install);
        assert!(m.install(&ctx).await.is_err());
        assert!(!m.is_installed(&ctx).await.unwrap());
        m.heal(Hook::Install);
        m.install(&ctx).await.unwrap();
        assert!(m.is_ready(&ctx).await);
        assert_eq!(m.calls(), vec![Hook::Install, Hook::Install]);
    }
}
