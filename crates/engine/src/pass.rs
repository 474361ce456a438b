//! One dispatch over one resource: the local status copy and the status
//! projector writing through it.

use keel_catalog::{Component, ComponentContext, HookError, Operation};
use keel_core::condition::append_condition;
use keel_core::{
    ComponentStatus, Condition, ConditionKind, Outcome, Platform, PlatformSpec, PlatformState, PlatformStatus,
    ResourceKey, SemVersion, UpdateEvent,
};
use tracing::{debug, info, warn};

use crate::Reconciler;

pub(crate) struct Pass<'a> {
    pub(crate) r: &'a Reconciler,
    pub(crate) platform: Platform,
    pub(crate) status: PlatformStatus,
    pub(crate) effective: PlatformSpec,
    pub(crate) key: ResourceKey,
    pub(crate) generation: i64,
}

impl<'a> Pass<'a> {
    pub(crate) fn new(r: &'a Reconciler, mut platform: Platform, effective: PlatformSpec) -> Self {
        let status = platform.status.take().unwrap_or_default();
        let key = platform.key();
        let generation = platform.generation();
        Self { r, platform, status, effective, key, generation }
    }

    pub(crate) fn ctx(&self, op: Operation) -> ComponentContext<'_> {
        ComponentContext::new(&self.platform, &self.effective, op, self.r.settings.dry_run)
    }

    pub(crate) fn state(&self) -> Option<PlatformState> {
        self.status.state
    }

    pub(crate) fn component_status(&self, name: &str) -> Option<&ComponentStatus> {
        self.status.components.get(name)
    }

    pub(crate) fn short(&self) -> Outcome {
        self.r.settings.backoff.short()
    }

    pub(crate) fn long(&self) -> Outcome {
        self.r.settings.backoff.long()
    }

    /// Apply `ev` to the local copy and forward it to the status writer.
    pub(crate) async fn emit(&mut self, ev: UpdateEvent) {
        if ev.is_empty() {
            return;
        }
        ev.apply_to(&mut self.status);
        self.r.writer.update(ev).await;
    }

    /// Record a lifecycle condition on a component.
    pub(crate) async fn record_component(&mut self, name: &str, kind: ConditionKind, message: impl Into<String>) {
        let version = self.r.manifest.component_version(name).map(str::to_string);
        let generation = self.generation;
        let cs = self.status.components.entry(name.to_string()).or_insert_with(|| ComponentStatus::disabled(name));
        if kind == ConditionKind::InstallStarted {
            // a (re)started install tracks the current generation
            cs.reconciling_generation = 0;
        }
        cs.record(kind, message, generation, version.as_deref());
        debug!(component = %name, condition = ?kind, state = ?cs.state, "component condition recorded");
        let ev = UpdateEvent::new(self.key.clone()).component(cs.clone());
        self.r.writer.update(ev).await;
    }

    /// Move the resource to `state`, dropping the `clear` condition kinds and
    /// appending `cond` when given.
    pub(crate) async fn transition(&mut self, state: PlatformState, cond: Option<(ConditionKind, &str)>, clear: &[ConditionKind]) {
        let mut conds = self.status.conditions.clone();
        conds.retain(|c| !clear.contains(&c.kind));
        if let Some((kind, msg)) = cond {
            append_condition(&mut conds, Condition::new(kind, msg));
        }
        info!(from = ?self.state(), to = %state.as_str(), "state transition");
        let mut ev = UpdateEvent::new(self.key.clone());
        ev.state = Some(state);
        ev.conditions = Some(conds);
        self.emit(ev).await;
    }

    /// Fold a pending availability snapshot into this dispatch and acknowledge it.
    pub(crate) async fn absorb_availability(&mut self) {
        let Some(h) = self.r.handoff.clone() else { return };
        if let Some(snap) = h.take() {
            if snap.key == self.key {
                self.emit(snap.to_event()).await;
            } else {
                self.r.writer.update(snap.to_event()).await;
            }
            h.acknowledge();
        }
    }

    pub(crate) async fn is_installed(&self, comp: &dyn Component) -> Option<bool> {
        match comp.is_installed(&self.ctx(Operation::Probe)).await {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(component = %comp.name(), error = %e, "installed check failed");
                None
            }
        }
    }

    pub(crate) fn log_hook_error(&self, comp: &dyn Component, hook: &str, e: &HookError) {
        metrics::counter!("keel_hook_failures_total", 1u64, "component" => comp.name().to_string(), "hook" => hook.to_string());
        if e.is_retryable() {
            debug!(component = %comp.name(), hook, error = %e, "hook not done yet");
        } else {
            warn!(component = %comp.name(), hook, error = %e, "hook failed");
        }
    }

    /// Best-effort recovery of installer state after a failed hook.
    pub(crate) async fn resolve_pending(&self, comp: &dyn Component, op: Operation) {
        if let Err(e) = comp.resolve_pending(&self.ctx(op)).await {
            warn!(component = %comp.name(), error = %e, "resolving pending installer state failed");
        }
    }

    /// Requested platform version, when set and well formed.
    pub(crate) fn requested_version(&self) -> Option<SemVersion> {
        let raw = self.platform.spec.version.as_deref().filter(|v| !v.is_empty())?;
        match SemVersion::parse(raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(version = %raw, error = %e, "ignoring malformed spec.version");
                None
            }
        }
    }

    pub(crate) fn operator_older_than_requested(&self) -> bool {
        self.requested_version().map(|v| self.r.operator_version < v).unwrap_or(false)
    }

    /// Version the platform currently runs at, or the operator's when unset.
    pub(crate) fn platform_version(&self) -> SemVersion {
        self.status
            .version
            .as_deref()
            .and_then(|v| SemVersion::parse(v).ok())
            .unwrap_or_else(|| self.r.operator_version.clone())
    }

    /// Whether the resource already converged at its current generation.
    pub(crate) fn settled(&self) -> bool {
        self.status.state == Some(PlatformState::Ready) && self.status.observed_generation >= self.generation
    }

    /// Create missing component statuses: installed components start Ready at
    /// the current generation, everything else Disabled. True when any was created.
    pub(crate) async fn initialize_component_statuses(&mut self) -> bool {
        let r = self.r;
        let mut ev = UpdateEvent::new(self.key.clone());
        for comp in r.catalog.components() {
            if !comp.operator_install_supported() || self.status.components.contains_key(comp.name()) {
                continue;
            }
            let cs = match self.is_installed(comp.as_ref()).await {
                Some(true) => ComponentStatus::ready(comp.name(), self.generation),
                Some(false) => ComponentStatus::disabled(comp.name()),
                None => continue,
            };
            ev = ev.component(cs);
        }
        if ev.components.is_empty() {
            return false;
        }
        info!(created = ev.components.len(), "component statuses initialized");
        self.emit(ev).await;
        true
    }
}
