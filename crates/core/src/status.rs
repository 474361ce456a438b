//! Status projection: per-component status bookkeeping and the update
//! events the engine hands to the status writer.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::{append_condition, ComponentState, Condition, ConditionKind, PlatformState};
use crate::resource::{InstanceInfo, PlatformStatus, ResourceKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub name: String,
    pub state: ComponentState,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub last_reconciled_generation: i64,
    #[serde(default)]
    pub reconciling_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<bool>,
}

impl ComponentStatus {
    pub fn disabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ComponentState::Disabled,
            conditions: Vec::new(),
            last_reconciled_generation: 0,
            reconciling_generation: 0,
            version: None,
            available: None,
        }
    }

    /// Status for a component found already installed on first sight.
    pub fn ready(name: impl Into<String>, generation: i64) -> Self {
        Self { state: ComponentState::Ready, last_reconciled_generation: generation, ..Self::disabled(name) }
    }

    /// Record a lifecycle condition and update state and generation bookkeeping.
    ///
    /// InstallComplete folds the in-flight generation (or the current one)
    /// into `last_reconciled_generation`; any other condition starts tracking
    /// `generation` as in flight if nothing is tracked yet.
    pub fn record(&mut self, kind: ConditionKind, message: impl Into<String>, generation: i64, version: Option<&str>) {
        append_condition(&mut self.conditions, Condition::new(kind, message));
        self.state = kind.component_state();
        if kind == ConditionKind::InstallComplete {
            let done = if self.reconciling_generation > 0 { self.reconciling_generation } else { generation };
            self.last_reconciled_generation = self.last_reconciled_generation.max(done);
            self.reconciling_generation = 0;
        } else if self.reconciling_generation == 0 {
            self.reconciling_generation = generation;
        }
        if matches!(kind, ConditionKind::InstallComplete | ConditionKind::UpgradeComplete) {
            if let Some(v) = version {
                self.version = Some(v.to_string());
            }
        }
    }

    /// State as implied by the tail condition; falls back to the stored state
    /// for statuses created without any condition.
    pub fn derived_state(&self) -> ComponentState {
        self.conditions.last().map(|c| c.kind.component_state()).unwrap_or(self.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state == ComponentState::Ready
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComponentDelta {
    Replace(ComponentStatus),
    Available(bool),
}

/// A batch of status changes for one resource.
///
/// `None` fields are left untouched when applied; `conditions` replaces the
/// whole top-level condition list.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    pub key: ResourceKey,
    pub state: Option<PlatformState>,
    pub conditions: Option<Vec<Condition>>,
    pub version: Option<String>,
    pub components: BTreeMap<String, ComponentDelta>,
    pub observed_generation: Option<i64>,
    pub observed_retry: Option<String>,
    pub available: Option<String>,
    pub instance: Option<InstanceInfo>,
}

impl UpdateEvent {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            state: None,
            conditions: None,
            version: None,
            components: BTreeMap::new(),
            observed_generation: None,
            observed_retry: None,
            available: None,
            instance: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.conditions.is_none()
            && self.version.is_none()
            && self.components.is_empty()
            && self.observed_generation.is_none()
            && self.observed_retry.is_none()
            && self.available.is_none()
            && self.instance.is_none()
    }

    pub fn component(mut self, status: ComponentStatus) -> Self {
        self.components.insert(status.name.clone(), ComponentDelta::Replace(status));
        self
    }

    /// Fold a later event for the same resource into this one.
    pub fn merge(&mut self, later: UpdateEvent) {
        if later.state.is_some() {
            self.state = later.state;
        }
        if later.conditions.is_some() {
            self.conditions = later.conditions;
        }
        if later.version.is_some() {
            self.version = later.version;
        }
        if later.observed_generation.is_some() {
            self.observed_generation = later.observed_generation;
        }
        if later.observed_retry.is_some() {
            self.observed_retry = later.observed_retry;
        }
        if later.available.is_some() {
            self.available = later.available;
        }
        if later.instance.is_some() {
            self.instance = later.instance;
        }
        for (name, delta) in later.components {
            match (self.components.get_mut(&name), delta) {
                (Some(ComponentDelta::Replace(cur)), ComponentDelta::Available(a)) => cur.available = Some(a),
                (_, delta) => {
                    self.components.insert(name, delta);
                }
            }
        }
    }

    pub fn apply_to(&self, status: &mut PlatformStatus) {
        if let Some(state) = self.state {
            status.state = Some(state);
        }
        if let Some(conds) = &self.conditions {
            status.conditions = conds.clone();
        }
        if let Some(v) = &self.version {
            status.version = Some(v.clone());
        }
        if let Some(g) = self.observed_generation {
            status.observed_generation = g;
        }
        if let Some(r) = &self.observed_retry {
            status.observed_retry = Some(r.clone());
        }
        if let Some(a) = &self.available {
            status.available = Some(a.clone());
        }
        if let Some(i) = &self.instance {
            status.instance = Some(i.clone());
        }
        for (name, delta) in &self.components {
            match delta {
                ComponentDelta::Replace(cs) => {
                    let mut next = cs.clone();
                    if next.available.is_none() {
                        next.available = status.components.get(name).and_then(|c| c.available);
                    }
                    status.components.insert(name.clone(), next);
                }
                ComponentDelta::Available(a) => {
                    if let Some(cs) = status.components.get_mut(name) {
                        cs.available = Some(*a);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_started_tracks_generation_once() {
        let mut cs = ComponentStatus::disabled("a");
        cs.record(ConditionKind::InstallStarted, "", 3, None);
        assert_eq!(cs.state, ComponentState::Installing);
        assert_eq!(cs.reconciling_generation, 3);
        cs.record(ConditionKind::PreInstall, "", 4, None);
        assert_eq!(cs.reconciling_generation, 3);
    }

    #[test]
    fn install_complete_folds_reconciling_generation() {
        let mut cs = ComponentStatus::disabled("a");
        cs.record(ConditionKind::InstallStarted, "", 3, None);
        cs.record(ConditionKind::InstallComplete, "", 5, Some("1.2.0"));
        assert_eq!(cs.last_reconciled_generation, 3);
        assert_eq!(cs.reconciling_generation, 0);
        assert_eq!(cs.version.as_deref(), Some("1.2.0"));
        assert_eq!(cs.state, ComponentState::Ready);
    }

    #[test]
    fn last_reconciled_generation_never_decreases() {
        let mut cs = ComponentStatus::ready("a", 9);
        cs.reconciling_generation = 4;
        cs.record(ConditionKind::InstallComplete, "", 4, None);
        assert_eq!(cs.last_reconciled_generation, 9);
        let mut prev = cs.last_reconciled_generation;
        for (i, kind) in [
            ConditionKind::InstallStarted,
            ConditionKind::InstallComplete,
            ConditionKind::UpgradeStarted,
            ConditionKind::UpgradeFailed,
            ConditionKind::InstallComplete,
        ]
        .into_iter()
        .enumerate()
        {
            cs.record(kind, "", 2 + i as i64 * 3, None);
            assert!(cs.last_reconciled_generation >= prev);
            prev = cs.last_reconciled_generation;
        }
    }

    #[test]
    fn state_follows_tail_condition() {
        let mut cs = ComponentStatus::ready("a", 1);
        assert_eq!(cs.derived_state(), ComponentState::Ready);
        for kind in [
            ConditionKind::UninstallStarted,
            ConditionKind::UninstallFailed,
            ConditionKind::UninstallComplete,
            ConditionKind::InstallStarted,
            ConditionKind::UninstallStarted,
        ] {
            cs.record(kind, "", 2, None);
            assert_eq!(cs.state, cs.derived_state());
            assert_eq!(cs.state, kind.component_state());
        }
    }

    #[test]
    fn merge_keeps_availability_on_replaced_component() {
        let key = ResourceKey::new("ns", "p");
        let mut first = UpdateEvent::new(key.clone()).component(ComponentStatus::ready("a", 1));
        let mut later = UpdateEvent::new(key);
        later.components.insert("a".into(), ComponentDelta::Available(true));
        later.available = Some("1/1".into());
        first.merge(later);
        let mut status = PlatformStatus::default();
        first.apply_to(&mut status);
        assert_eq!(status.components["a"].available, Some(true));
        assert_eq!(status.available.as_deref(), Some("1/1"));
    }

    #[test]
    fn replace_preserves_existing_availability() {
        let mut status = PlatformStatus::default();
        let mut cs = ComponentStatus::ready("a", 1);
        cs.available = Some(true);
        status.components.insert("a".into(), cs);
        let ev = UpdateEvent::new(ResourceKey::new("ns", "p")).component(ComponentStatus::ready("a", 2));
        ev.apply_to(&mut status);
        assert_eq!(status.components["a"].available, Some(true));
        assert_eq!(status.components["a"].last_reconciled_generation, 2);
    }
}
