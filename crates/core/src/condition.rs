//! Conditions and the lifecycle states derived from them.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionKind {
    PreInstall,
    InstallStarted,
    InstallComplete,
    InstallFailed,
    UpgradeStarted,
    UpgradeComplete,
    UpgradeFailed,
    UpgradePaused,
    UninstallStarted,
    UninstallComplete,
    UninstallFailed,
}

impl ConditionKind {
    /// Component state implied by a component's tail condition.
    pub fn component_state(self) -> ComponentState {
        match self {
            ConditionKind::PreInstall => ComponentState::PreInstalling,
            ConditionKind::InstallStarted => ComponentState::Installing,
            ConditionKind::InstallComplete => ComponentState::Ready,
            ConditionKind::InstallFailed => ComponentState::Failed,
            ConditionKind::UpgradeStarted => ComponentState::Upgrading,
            ConditionKind::UpgradeComplete => ComponentState::Ready,
            ConditionKind::UpgradeFailed => ComponentState::Failed,
            ConditionKind::UpgradePaused => ComponentState::Ready,
            ConditionKind::UninstallStarted => ComponentState::Uninstalling,
            ConditionKind::UninstallComplete => ComponentState::Uninstalled,
            ConditionKind::UninstallFailed => ComponentState::Failed,
        }
    }

    /// Platform state implied by the resource's tail condition.
    pub fn platform_state(self) -> PlatformState {
        match self {
            ConditionKind::PreInstall | ConditionKind::InstallStarted => PlatformState::Installing,
            ConditionKind::InstallComplete => PlatformState::Ready,
            ConditionKind::UpgradeStarted => PlatformState::Upgrading,
            ConditionKind::UpgradeComplete => PlatformState::Ready,
            ConditionKind::UpgradePaused => PlatformState::Paused,
            ConditionKind::UninstallStarted => PlatformState::Uninstalling,
            ConditionKind::UninstallComplete => PlatformState::Ready,
            ConditionKind::InstallFailed | ConditionKind::UpgradeFailed | ConditionKind::UninstallFailed => {
                PlatformState::Failed
            }
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ConditionKind::InstallFailed | ConditionKind::UpgradeFailed | ConditionKind::UninstallFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    pub status: ConditionStatus,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: String,
}

impl Condition {
    pub fn new(kind: ConditionKind, message: impl Into<String>) -> Self {
        let status = if kind.is_failure() { ConditionStatus::False } else { ConditionStatus::True };
        Self {
            kind,
            status,
            message: message.into(),
            last_transition_time: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }
}

/// Drop any condition of the same kind and push `cond` to the tail.
pub fn append_condition(conditions: &mut Vec<Condition>, cond: Condition) {
    conditions.retain(|c| c.kind != cond.kind);
    conditions.push(cond);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ComponentState {
    Disabled,
    PreInstalling,
    Installing,
    Ready,
    Upgrading,
    Uninstalling,
    Uninstalled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PlatformState {
    Ready,
    Installing,
    Upgrading,
    Paused,
    Uninstalling,
    Failed,
}

impl PlatformState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformState::Ready => "Ready",
            PlatformState::Installing => "Installing",
            PlatformState::Upgrading => "Upgrading",
            PlatformState::Paused => "Paused",
            PlatformState::Uninstalling => "Uninstalling",
            PlatformState::Failed => "Failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ConditionKind; 11] = [
        ConditionKind::PreInstall,
        ConditionKind::InstallStarted,
        ConditionKind::InstallComplete,
        ConditionKind::InstallFailed,
        ConditionKind::UpgradeStarted,
        ConditionKind::UpgradeComplete,
        ConditionKind::UpgradeFailed,
        ConditionKind::UpgradePaused,
        ConditionKind::UninstallStarted,
        ConditionKind::UninstallComplete,
        ConditionKind::UninstallFailed,
    ];

    #[test]
    fn failures_map_to_failed() {
        for k in ALL {
            assert_eq!(k.is_failure(), k.component_state() == ComponentState::Failed, "{k:?}");
            assert_eq!(k.is_failure(), k.platform_state() == PlatformState::Failed, "{k:?}");
        }
    }

    #[test]
    fn uninstall_complete_is_distinct_for_components() {
        assert_eq!(ConditionKind::UninstallComplete.component_state(), ComponentState::Uninstalled);
        assert_eq!(ConditionKind::UninstallComplete.platform_state(), PlatformState::Ready);
        assert_eq!(ConditionKind::UpgradePaused.platform_state(), PlatformState::Paused);
    }

    #[test]
    fn append_replaces_and_moves_to_tail() {
        let mut conds = Vec::new();
        append_condition(&mut conds, Condition::new(ConditionKind::InstallStarted, "a"));
        append_condition(&mut conds, Condition::new(ConditionKind::InstallComplete, "b"));
        append_condition(&mut conds, Condition::new(ConditionKind::InstallStarted, "c"));
        assert_eq!(conds.len(), 2);
        assert_eq!(conds[0].kind, ConditionKind::InstallComplete);
        assert_eq!(conds[1].kind, ConditionKind::InstallStarted);
        assert_eq!(conds[1].message, "c");
        for k in ALL {
            append_condition(&mut conds, Condition::new(k, ""));
            append_condition(&mut conds, Condition::new(k, ""));
        }
        assert_eq!(conds.len(), ALL.len());
    }

    #[test]
    fn condition_serializes_type_field() {
        let c = Condition::new(ConditionKind::UpgradeFailed, "boom");
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "UpgradeFailed");
        assert_eq!(v["status"], "False");
        let ts = v["lastTransitionTime"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }
}
