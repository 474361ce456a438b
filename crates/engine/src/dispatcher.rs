//! Top-level state handlers.

use std::collections::BTreeMap;

use keel_catalog::Operation;
use keel_core::{ConditionKind, InstanceInfo, Outcome, PlatformState, SemVersion, UpdateEvent};
use tracing::{debug, info};

use crate::pass::Pass;
use crate::tracker::{UninstallPhase, UpgradePhase};

impl<'a> Pass<'a> {
    pub(crate) async fn run(&mut self) -> Outcome {
        let state = self.state();
        debug!(state = ?state, generation = self.generation, "handling");
        match state {
            None => self.handle_empty().await,
            Some(PlatformState::Ready) => self.handle_ready().await,
            Some(PlatformState::Installing) => self.handle_installing().await,
            Some(PlatformState::Upgrading) => self.handle_upgrading().await,
            Some(PlatformState::Paused) => self.handle_paused().await,
            Some(PlatformState::Uninstalling) => self.handle_uninstalling().await,
            Some(PlatformState::Failed) => self.handle_failed().await,
        }
    }

    async fn handle_empty(&mut self) -> Outcome {
        if self.platform.deletion_requested() {
            return self.divert_to_uninstall().await;
        }
        self.transition(PlatformState::Ready, None, &[]).await;
        self.short()
    }

    async fn divert_to_uninstall(&mut self) -> Outcome {
        self.begin_uninstall().await;
        self.handle_uninstalling().await
    }

    async fn handle_ready(&mut self) -> Outcome {
        if self.platform.deletion_requested() {
            return self.divert_to_uninstall().await;
        }
        if self.initialize_component_statuses().await {
            return self.short();
        }
        if !self.status.is_install_complete() {
            if self.status.version.is_none() {
                let mut ev = UpdateEvent::new(self.key.clone());
                ev.version = Some(self.r.manifest.version.clone());
                self.emit(ev).await;
            }
            self.transition(PlatformState::Installing, Some((ConditionKind::InstallStarted, "install started")), &[])
                .await;
            return self.short();
        }
        if self.upgrade_requested() {
            if self.operator_older_than_requested() {
                self.pause().await;
                return self.long();
            }
            self.begin_upgrade().await;
            return self.short();
        }

        let r = self.r;
        let mut tracker = r.trackers.take_install(&self.key);
        let out = self.install_components(&mut tracker).await;
        r.trackers.put_install(&self.key, tracker);
        if out == Outcome::Done && self.status.observed_generation != self.generation {
            let mut ev = UpdateEvent::new(self.key.clone());
            ev.observed_generation = Some(self.generation);
            self.emit(ev).await;
        }
        out
    }

    /// spec.version names a release other than the one installed.
    fn upgrade_requested(&self) -> bool {
        let Some(requested) = self.requested_version() else { return false };
        match self.status.version.as_deref().map(SemVersion::parse) {
            Some(Ok(current)) => current != requested,
            _ => true,
        }
    }

    async fn handle_installing(&mut self) -> Outcome {
        if self.platform.deletion_requested() {
            return self.divert_to_uninstall().await;
        }
        if self.initialize_component_statuses().await {
            return self.short();
        }
        let r = self.r;
        let mut tracker = r.trackers.take_install(&self.key);
        let out = self.install_components(&mut tracker).await;
        r.trackers.put_install(&self.key, tracker);
        if out != Outcome::Done {
            return out;
        }

        let urls = self.instance_urls().await;
        let mut ev = UpdateEvent::new(self.key.clone());
        ev.version = Some(self.r.manifest.version.clone());
        ev.observed_generation = Some(self.generation);
        ev.instance = Some(InstanceInfo { urls });
        self.emit(ev).await;
        self.transition(PlatformState::Ready, Some((ConditionKind::InstallComplete, "install complete")), &[]).await;
        info!(version = %self.r.manifest.version, "platform installed");
        Outcome::Done
    }

    /// Public endpoints of installed components.
    async fn instance_urls(&self) -> BTreeMap<String, String> {
        let ctx = self.ctx(Operation::Probe);
        let mut urls = BTreeMap::new();
        for comp in self.r.catalog.components() {
            if !comp.is_enabled(&self.effective) {
                continue;
            }
            if let Some(url) = comp.endpoint(&ctx).await {
                urls.insert(comp.name().to_string(), url);
            }
        }
        urls
    }

    async fn handle_upgrading(&mut self) -> Outcome {
        if self.platform.deletion_requested() {
            return self.divert_to_uninstall().await;
        }
        if self.operator_older_than_requested() {
            self.pause().await;
            return self.long();
        }
        let r = self.r;
        let mut tracker = r.trackers.take_upgrade(&self.key, self.generation);
        let out = self.run_upgrade(&mut tracker).await;
        if tracker.phase != UpgradePhase::End {
            r.trackers.put_upgrade(&self.key, tracker);
        }
        out
    }

    async fn pause(&mut self) {
        let msg = format!(
            "operator {} is older than requested {}",
            self.r.operator_version,
            self.platform.spec.version.as_deref().unwrap_or_default()
        );
        info!(%msg, "upgrade paused");
        self.transition(PlatformState::Paused, Some((ConditionKind::UpgradePaused, &msg)), &[]).await;
    }

    async fn handle_paused(&mut self) -> Outcome {
        if self.platform.deletion_requested() {
            return self.divert_to_uninstall().await;
        }
        if self.operator_older_than_requested() {
            return self.long();
        }
        info!("operator now meets the requested version; resuming");
        self.transition(PlatformState::Ready, None, &[]).await;
        self.short()
    }

    async fn handle_uninstalling(&mut self) -> Outcome {
        let r = self.r;
        let mut tracker = r.trackers.take_uninstall(&self.key, self.generation);
        let out = self.run_uninstall(&mut tracker).await;
        if tracker.phase != UninstallPhase::End {
            r.trackers.put_uninstall(&self.key, tracker);
        }
        out
    }

    async fn handle_failed(&mut self) -> Outcome {
        if self.platform.deletion_requested() {
            return self.divert_to_uninstall().await;
        }
        let token = self.platform.retry_token().map(str::to_string);
        if token.is_some() && token != self.status.observed_retry {
            info!(retry = ?token, "retry requested");
            self.r.trackers.reset(&self.key);
            let mut ev = UpdateEvent::new(self.key.clone());
            ev.observed_retry = token;
            self.emit(ev).await;
            self.transition(PlatformState::Ready, None, &[]).await;
            return self.short();
        }
        if self.operator_older_than_requested() {
            self.pause().await;
        }
        self.long()
    }
}
