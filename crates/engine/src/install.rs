//! Per-component install machine.

use keel_catalog::{Component, Operation};
use keel_core::{needs_reentry_with, ComponentState, ConditionKind, Outcome};
use tracing::{debug, info};

use crate::pass::Pass;
use crate::tracker::{InstallStep, InstallTracker};

impl<'a> Pass<'a> {
    /// Advance every component's install machine once; requeue if any is busy.
    pub(crate) async fn install_components(&mut self, tracker: &mut InstallTracker) -> Outcome {
        let r = self.r;
        let mut out = Outcome::Done;
        for comp in r.catalog.components() {
            let step = tracker.steps.entry(comp.name().to_string()).or_insert(InstallStep::Init);
            if *step == InstallStep::End {
                *step = InstallStep::Init;
            }
            out = out.max(self.install_one(comp.as_ref(), step).await);
        }
        out
    }

    async fn install_one(&mut self, comp: &dyn Component, step: &mut InstallStep) -> Outcome {
        let name = comp.name();
        let platform_state = self.state().unwrap_or(keel_core::PlatformState::Ready);
        if !matches!(*step, InstallStep::Init | InstallStep::End) {
            let restart = self
                .component_status(name)
                .map(|cs| keel_core::needs_reentry(cs, self.generation, platform_state))
                .unwrap_or(false);
            if restart {
                info!(component = %name, from = ?*step, "generation changed mid-install; restarting");
                *step = InstallStep::InstallStarted;
            }
        }
        loop {
            match *step {
                InstallStep::Init => {
                    if !comp.operator_install_supported() || !comp.is_enabled(&self.effective) {
                        *step = InstallStep::End;
                        continue;
                    }
                    let Some(cs) = self.component_status(name) else {
                        // installed check failed when statuses were created
                        debug!(component = %name, "no status yet; retrying");
                        return self.short();
                    };
                    *step = match cs.state {
                        ComponentState::Disabled => InstallStep::Disabled,
                        ComponentState::PreInstalling | ComponentState::Installing => InstallStep::InstallStarted,
                        _ => InstallStep::ReadyGate,
                    };
                }
                InstallStep::ReadyGate => {
                    let watched = self.r.trackers.is_watched(&self.key, name);
                    let drifted = self
                        .component_status(name)
                        .map(|cs| needs_reentry_with(cs, self.generation, platform_state, watched))
                        .unwrap_or(false);
                    if self.status.is_install_complete() && drifted && comp.monitor_overrides(&self.effective) {
                        if watched {
                            self.r.trackers.take_watched(&self.key, name);
                        }
                        info!(component = %name, generation = self.generation, "configuration changed; reinstalling");
                        *step = InstallStep::InstallStarted;
                    } else {
                        *step = InstallStep::End;
                    }
                }
                InstallStep::Disabled => {
                    let version_ok = comp.min_version().map(|min| self.platform_version() >= *min).unwrap_or(true);
                    if version_ok && !self.settled() {
                        self.record_component(name, ConditionKind::PreInstall, "component enabled").await;
                        *step = InstallStep::InstallStarted;
                    } else {
                        debug!(component = %name, version_ok, "disabled component left alone");
                        *step = InstallStep::End;
                    }
                }
                InstallStep::InstallStarted => {
                    self.record_component(name, ConditionKind::InstallStarted, "install started").await;
                    *step = InstallStep::PreInstall;
                }
                InstallStep::PreInstall => {
                    let ctx = self.ctx(Operation::Install);
                    if !self.r.catalog.dependencies_met(comp, &ctx).await {
                        debug!(component = %name, "waiting for dependencies");
                        return self.short();
                    }
                    if let Err(e) = comp.pre_install(&ctx).await {
                        self.log_hook_error(comp, "pre_install", &e);
                        return self.short();
                    }
                    *step = InstallStep::Install;
                }
                InstallStep::Install => {
                    if let Err(e) = comp.install(&self.ctx(Operation::Install)).await {
                        self.log_hook_error(comp, "install", &e);
                        return self.short();
                    }
                    *step = InstallStep::WaitReady;
                }
                InstallStep::WaitReady => {
                    if !comp.is_ready(&self.ctx(Operation::Install)).await {
                        debug!(component = %name, "waiting for component to become ready");
                        return self.short();
                    }
                    *step = InstallStep::PostInstall;
                }
                InstallStep::PostInstall => {
                    if let Err(e) = comp.post_install(&self.ctx(Operation::Install)).await {
                        self.log_hook_error(comp, "post_install", &e);
                        return self.short();
                    }
                    *step = InstallStep::InstallComplete;
                }
                InstallStep::InstallComplete => {
                    self.record_component(name, ConditionKind::InstallComplete, "install complete").await;
                    info!(component = %name, "component installed");
                    *step = InstallStep::End;
                }
                InstallStep::End => return Outcome::Done,
            }
        }
    }
}
