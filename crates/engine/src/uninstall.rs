//! Uninstall: resource teardown phases and the per-component machine.

use std::collections::BTreeSet;

use keel_catalog::{Component, HookError, Operation};
use keel_core::{ConditionKind, Outcome, PlatformState};
use tracing::{debug, error, info, warn};

use crate::pass::Pass;
use crate::tracker::{UninstallPhase, UninstallStep, UninstallTracker};

/// Namespaces never removed during teardown.
const PROTECTED_NAMESPACES: [&str; 2] = ["default", "kube-system"];

impl<'a> Pass<'a> {
    /// Top-level Uninstalling with UninstallStarted, unless already there.
    pub(crate) async fn begin_uninstall(&mut self) {
        if self.state() == Some(PlatformState::Uninstalling) {
            return;
        }
        self.transition(PlatformState::Uninstalling, Some((ConditionKind::UninstallStarted, "uninstall started")), &[])
            .await;
    }

    pub(crate) async fn run_uninstall(&mut self, t: &mut UninstallTracker) -> Outcome {
        let r = self.r;
        loop {
            match t.phase {
                UninstallPhase::Start => {
                    if self.status.last_condition().map(|c| c.kind) != Some(ConditionKind::UninstallStarted) {
                        self.transition(
                            PlatformState::Uninstalling,
                            Some((ConditionKind::UninstallStarted, "uninstall started")),
                            &[],
                        )
                        .await;
                    }
                    t.phase = UninstallPhase::DetachLocalCluster;
                }
                UninstallPhase::DetachLocalCluster => {
                    if r.catalog.components().iter().any(|c| c.registers_local_cluster()) {
                        if let Err(e) = r.cluster.detach_local_cluster().await {
                            warn!(error = %e, "detaching local cluster failed");
                            return self.short();
                        }
                    }
                    t.phase = UninstallPhase::Components;
                }
                UninstallPhase::Components => {
                    let mut out = Outcome::Done;
                    for comp in r.catalog.components() {
                        let step = t.steps.entry(comp.name().to_string()).or_insert(UninstallStep::Init);
                        out = out.max(self.uninstall_one(comp.as_ref(), step).await);
                    }
                    if out != Outcome::Done {
                        return out;
                    }
                    t.phase = UninstallPhase::Cleanup;
                }
                UninstallPhase::Cleanup => {
                    if let Some(out) = self.cleanup().await {
                        return out;
                    }
                    t.phase = UninstallPhase::Done;
                }
                UninstallPhase::Done => {
                    if self.status.last_condition().map(|c| c.kind) != Some(ConditionKind::UninstallComplete) {
                        self.transition(
                            PlatformState::Uninstalling,
                            Some((ConditionKind::UninstallComplete, "uninstall complete")),
                            &[],
                        )
                        .await;
                    }
                    if self.platform.deletion_requested() {
                        if let Err(e) = r.cluster.remove_finalizer(&self.key).await {
                            warn!(error = %e, "removing finalizer failed");
                            return self.short();
                        }
                        r.trackers.forget(&self.key);
                    }
                    info!("platform uninstalled");
                    t.phase = UninstallPhase::End;
                }
                UninstallPhase::End => return Outcome::Done,
            }
        }
    }

    /// Namespaces to remove once every component is gone.
    fn teardown_namespaces(&self) -> BTreeSet<String> {
        let r = self.r;
        r.catalog
            .components()
            .iter()
            .map(|c| c.namespace().to_string())
            .chain(r.manifest.shared_namespaces.iter().cloned())
            .filter(|ns| {
                !ns.is_empty()
                    && *ns != self.key.namespace
                    && *ns != r.settings.install_namespace
                    && !PROTECTED_NAMESPACES.contains(&ns.as_str())
            })
            .collect()
    }

    /// Delete namespaces and the lifecycle account. `Some` while still waiting.
    async fn cleanup(&mut self) -> Option<Outcome> {
        let r = self.r;
        let namespaces = self.teardown_namespaces();
        if r.settings.dry_run {
            debug!(count = namespaces.len(), "dry run: keeping namespaces");
        } else {
            for ns in &namespaces {
                match r.cluster.namespace_exists(ns).await {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(e) => {
                        warn!(namespace = %ns, error = %e, "checking namespace failed");
                        return Some(self.short());
                    }
                }
                if let Err(e) = r.cluster.delete_namespace(ns).await {
                    warn!(namespace = %ns, error = %e, "deleting namespace failed");
                    return Some(self.short());
                }
            }
            let mut remaining = 0usize;
            for ns in &namespaces {
                match r.cluster.namespace_exists(ns).await {
                    Ok(true) => remaining += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(namespace = %ns, error = %e, "checking namespace failed");
                        return Some(self.short());
                    }
                }
            }
            if remaining > 0 {
                debug!(remaining, "waiting for namespaces to terminate");
                return Some(self.short());
            }
        }
        if let Err(e) = r.cluster.delete_lifecycle_account(&self.key).await {
            warn!(error = %e, "deleting lifecycle account failed");
            return Some(self.short());
        }
        None
    }

    async fn uninstall_one(&mut self, comp: &dyn Component, step: &mut UninstallStep) -> Outcome {
        let name = comp.name();
        loop {
            match *step {
                UninstallStep::Init => {
                    if !comp.operator_install_supported() {
                        *step = UninstallStep::End;
                        continue;
                    }
                    match self.is_installed(comp).await {
                        None => return self.short(),
                        Some(false) => *step = UninstallStep::End,
                        Some(true) => *step = UninstallStep::PreUninstall,
                    }
                }
                UninstallStep::PreUninstall => {
                    self.record_component(name, ConditionKind::UninstallStarted, "uninstall started").await;
                    if let Err(e) = comp.pre_uninstall(&self.ctx(Operation::Uninstall)).await {
                        return self.uninstall_failed(comp, "pre_uninstall", e).await;
                    }
                    *step = UninstallStep::Uninstall;
                }
                UninstallStep::Uninstall => {
                    if let Err(e) = comp.uninstall(&self.ctx(Operation::Uninstall)).await {
                        return self.uninstall_failed(comp, "uninstall", e).await;
                    }
                    *step = UninstallStep::WaitUninstalled;
                }
                UninstallStep::WaitUninstalled => {
                    if self.is_installed(comp).await != Some(false) {
                        debug!(component = %name, "waiting for component removal");
                        return self.short();
                    }
                    *step = UninstallStep::PostUninstall;
                }
                UninstallStep::PostUninstall => {
                    if let Err(e) = comp.post_uninstall(&self.ctx(Operation::Uninstall)).await {
                        return self.uninstall_failed(comp, "post_uninstall", e).await;
                    }
                    *step = UninstallStep::Done;
                }
                UninstallStep::Done => {
                    self.record_component(name, ConditionKind::UninstallComplete, "uninstall complete").await;
                    info!(component = %name, "component uninstalled");
                    *step = UninstallStep::End;
                }
                UninstallStep::End => return Outcome::Done,
            }
        }
    }

    async fn uninstall_failed(&mut self, comp: &dyn Component, hook: &str, e: HookError) -> Outcome {
        self.log_hook_error(comp, hook, &e);
        self.resolve_pending(comp, Operation::Uninstall).await;
        error!(component = %comp.name(), hook, error = %e, "uninstall failed");
        self.record_component(comp.name(), ConditionKind::UninstallFailed, format!("{hook} failed: {e}")).await;
        self.long()
    }
}
