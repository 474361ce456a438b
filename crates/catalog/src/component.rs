use std::fmt;

use keel_core::{Platform, PlatformSpec, SemVersion};

/// Lifecycle operation a hook is being called for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Install,
    Upgrade,
    Uninstall,
    Probe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Install => "install",
            Operation::Upgrade => "upgrade",
            Operation::Uninstall => "uninstall",
            Operation::Probe => "probe",
        };
        f.write_str(s)
    }
}

/// Everything a hook may look at: the live resource, the merged effective
/// spec, and the operation in progress.
#[derive(Clone, Copy)]
pub struct ComponentContext<'a> {
    pub platform: &'a Platform,
    pub effective: &'a PlatformSpec,
    pub operation: Operation,
    pub dry_run: bool,
}

impl<'a> ComponentContext<'a> {
    pub fn new(platform: &'a Platform, effective: &'a PlatformSpec, operation: Operation, dry_run: bool) -> Self {
        Self { platform, effective, operation, dry_run }
    }

    pub fn with_operation(self, operation: Operation) -> Self {
        Self { operation, ..self }
    }

    /// Installer overrides supplied for `component`.
    pub fn overrides(&self, component: &str) -> Option<&'a serde_json::Value> {
        self.effective.components.get(component).and_then(|t| t.overrides.as_ref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Expected while something external settles; logged quietly.
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("{0}")]
    Failed(String),
}

impl HookError {
    pub fn failed(e: impl fmt::Display) -> Self {
        HookError::Failed(e.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HookError::Retryable(_))
    }
}

/// A managed piece of software.
///
/// Hooks must be idempotent: the engine may call any of them again after a
/// crash or a requeue.
#[allow(unused_variables)]
#[async_trait::async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn dependencies(&self) -> &[String];

    /// Lowest platform version this component can be installed at.
    fn min_version(&self) -> Option<&SemVersion> { None }

    fn is_enabled(&self, effective: &PlatformSpec) -> bool;

    /// Whether the engine installs this component at all.
    fn operator_install_supported(&self) -> bool { true }

    /// Whether spec edits re-apply this component once it is Ready.
    fn monitor_overrides(&self, effective: &PlatformSpec) -> bool {
        effective.components.get(self.name()).and_then(|t| t.monitor_changes).unwrap_or(true)
    }

    /// Whether this component registers the hosting cluster with itself, which
    /// must be detached before anything is uninstalled.
    fn registers_local_cluster(&self) -> bool { false }

    async fn is_installed(&self, ctx: &ComponentContext<'_>) -> Result<bool, HookError>;
    async fn is_ready(&self, ctx: &ComponentContext<'_>) -> bool;

    async fn pre_install(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError> { Ok(()) }
    async fn install(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError>;
    async fn post_install(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError> { Ok(()) }

    async fn pre_upgrade(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError> { Ok(()) }
    async fn upgrade(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError>;
    async fn post_upgrade(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError> { Ok(()) }

    async fn pre_uninstall(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError> { Ok(()) }
    async fn uninstall(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError>;
    async fn post_uninstall(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError> { Ok(()) }

    /// Clear installer state left behind by an interrupted operation.
    async fn resolve_pending(&self, ctx: &ComponentContext<'_>) -> Result<(), HookError> { Ok(()) }

    /// Public URL published in the platform status, if any.
    async fn endpoint(&self, ctx: &ComponentContext<'_>) -> Option<String> { None }
}
