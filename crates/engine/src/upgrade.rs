//! Upgrade: the resource-level phases and the per-component machine.

use keel_catalog::{Component, HookError, Operation};
use keel_core::{ConditionKind, Outcome, PlatformState, UpdateEvent};
use tracing::{debug, error, info};

use crate::pass::Pass;
use crate::tracker::{UpgradePhase, UpgradeStep, UpgradeTracker};

/// Conditions left over from earlier upgrade attempts.
pub(crate) const UPGRADE_CONDITIONS: [ConditionKind; 4] = [
    ConditionKind::UpgradeStarted,
    ConditionKind::UpgradeComplete,
    ConditionKind::UpgradeFailed,
    ConditionKind::UpgradePaused,
];

impl<'a> Pass<'a> {
    pub(crate) async fn run_upgrade(&mut self, t: &mut UpgradeTracker) -> Outcome {
        let r = self.r;
        loop {
            match t.phase {
                UpgradePhase::Start => {
                    t.phase = UpgradePhase::Components;
                    if self.status.last_condition().map(|c| c.kind) != Some(ConditionKind::UpgradeStarted) {
                        self.begin_upgrade().await;
                        return self.short();
                    }
                }
                UpgradePhase::Components => {
                    for comp in r.catalog.components() {
                        let step = t.steps.entry(comp.name().to_string()).or_insert(UpgradeStep::Init);
                        let out = self.upgrade_one(comp.as_ref(), step).await;
                        if out != Outcome::Done {
                            return out;
                        }
                    }
                    t.phase = UpgradePhase::WaitReady;
                }
                UpgradePhase::WaitReady => {
                    for comp in r.catalog.components() {
                        if !comp.operator_install_supported() || self.is_installed(comp.as_ref()).await != Some(true) {
                            continue;
                        }
                        if !comp.is_ready(&self.ctx(Operation::Upgrade)).await {
                            debug!(component = %comp.name(), "waiting for upgraded component");
                            return self.short();
                        }
                    }
                    t.phase = UpgradePhase::Complete;
                }
                UpgradePhase::Complete => {
                    self.complete_upgrade().await;
                    t.phase = UpgradePhase::End;
                    return self.short();
                }
                UpgradePhase::End => return Outcome::Done,
            }
        }
    }

    /// Top-level Upgrading with a fresh UpgradeStarted condition.
    pub(crate) async fn begin_upgrade(&mut self) {
        let target = self.platform.spec.version.clone().unwrap_or_default();
        let msg = format!("upgrade to {target} started");
        self.transition(PlatformState::Upgrading, Some((ConditionKind::UpgradeStarted, &msg)), &UPGRADE_CONDITIONS).await;
    }

    async fn complete_upgrade(&mut self) {
        let r = self.r;
        let target = self.platform.spec.version.clone().unwrap_or_else(|| r.operator_version.to_string());
        let mut ev = UpdateEvent::new(self.key.clone());
        for comp in r.catalog.components() {
            let Some(cs) = self.status.components.get(comp.name()) else { continue };
            // installed-but-disabled components are upgraded too
            let touched = cs.reconciling_generation != 0;
            if !touched && !comp.is_enabled(&self.effective) {
                continue;
            }
            let mut cs = cs.clone();
            cs.last_reconciled_generation = cs.last_reconciled_generation.max(self.generation);
            cs.reconciling_generation = 0;
            ev = ev.component(cs);
        }
        ev.version = Some(target.clone());
        self.emit(ev).await;
        let msg = format!("upgrade to {target} complete");
        self.transition(PlatformState::Ready, Some((ConditionKind::UpgradeComplete, &msg)), &[]).await;
        info!(version = %target, "platform upgraded");
    }

    async fn upgrade_one(&mut self, comp: &dyn Component, step: &mut UpgradeStep) -> Outcome {
        let name = comp.name();
        loop {
            match *step {
                UpgradeStep::Init => {
                    if !comp.operator_install_supported() {
                        *step = UpgradeStep::End;
                        continue;
                    }
                    match self.is_installed(comp).await {
                        None => return self.short(),
                        Some(false) => *step = UpgradeStep::End,
                        Some(true) => {
                            self.record_component(name, ConditionKind::UpgradeStarted, "upgrade started").await;
                            *step = UpgradeStep::PreUpgrade;
                        }
                    }
                }
                UpgradeStep::PreUpgrade => {
                    if let Err(e) = comp.pre_upgrade(&self.ctx(Operation::Upgrade)).await {
                        return self.upgrade_failed(comp, step, "pre_upgrade", e).await;
                    }
                    *step = UpgradeStep::Upgrade;
                }
                UpgradeStep::Upgrade => {
                    if let Err(e) = comp.upgrade(&self.ctx(Operation::Upgrade)).await {
                        return self.upgrade_failed(comp, step, "upgrade", e).await;
                    }
                    *step = UpgradeStep::WaitReady;
                }
                UpgradeStep::WaitReady => {
                    if !comp.is_ready(&self.ctx(Operation::Upgrade)).await {
                        debug!(component = %name, "waiting for component after upgrade");
                        return self.short();
                    }
                    *step = UpgradeStep::PostUpgrade;
                }
                UpgradeStep::PostUpgrade => {
                    if let Err(e) = comp.post_upgrade(&self.ctx(Operation::Upgrade)).await {
                        self.log_hook_error(comp, "post_upgrade", &e);
                        return self.short();
                    }
                    *step = UpgradeStep::Done;
                }
                UpgradeStep::Done => {
                    self.record_component(name, ConditionKind::UpgradeComplete, "upgrade complete").await;
                    info!(component = %name, "component upgraded");
                    *step = UpgradeStep::End;
                }
                UpgradeStep::Failed => return self.long(),
                UpgradeStep::End => return Outcome::Done,
            }
        }
    }

    /// Escalate a pre-upgrade/upgrade hook failure to the resource.
    async fn upgrade_failed(&mut self, comp: &dyn Component, step: &mut UpgradeStep, hook: &str, e: HookError) -> Outcome {
        self.log_hook_error(comp, hook, &e);
        self.resolve_pending(comp, Operation::Upgrade).await;
        let msg = format!("{} {hook} failed: {e}", comp.name());
        error!(component = %comp.name(), hook, error = %e, "upgrade failed");
        self.record_component(comp.name(), ConditionKind::UpgradeFailed, msg.clone()).await;
        self.transition(PlatformState::Failed, Some((ConditionKind::UpgradeFailed, &msg)), &[]).await;
        *step = UpgradeStep::Failed;
        self.long()
    }
}
