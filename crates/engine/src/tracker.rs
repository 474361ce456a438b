//! In-memory lifecycle trackers.
//!
//! Trackers only let a dispatch resume where the previous one stopped; all
//! durable progress lives in the resource status. A dispatch takes its
//! tracker out of the cache, works on it, and puts it back.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use keel_core::ResourceKey;
use rustc_hash::FxHashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    Init,
    Disabled,
    ReadyGate,
    InstallStarted,
    PreInstall,
    Install,
    WaitReady,
    PostInstall,
    InstallComplete,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStep {
    Init,
    PreUpgrade,
    Upgrade,
    WaitReady,
    PostUpgrade,
    Done,
    Failed,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallStep {
    Init,
    PreUninstall,
    Uninstall,
    WaitUninstalled,
    PostUninstall,
    Done,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePhase {
    Start,
    Components,
    WaitReady,
    Complete,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallPhase {
    Start,
    DetachLocalCluster,
    Components,
    Cleanup,
    Done,
    End,
}

#[derive(Debug, Default)]
pub struct InstallTracker {
    pub steps: HashMap<String, InstallStep>,
}

#[derive(Debug)]
pub struct UpgradeTracker {
    pub generation: i64,
    pub phase: UpgradePhase,
    pub steps: HashMap<String, UpgradeStep>,
}

impl UpgradeTracker {
    pub fn new(generation: i64) -> Self {
        Self { generation, phase: UpgradePhase::Start, steps: HashMap::new() }
    }
}

#[derive(Debug)]
pub struct UninstallTracker {
    pub generation: i64,
    pub phase: UninstallPhase,
    pub steps: HashMap<String, UninstallStep>,
}

impl UninstallTracker {
    pub fn new(generation: i64) -> Self {
        Self { generation, phase: UninstallPhase::Start, steps: HashMap::new() }
    }
}

/// Process-wide tracker store, injected into the reconciler.
#[derive(Default)]
pub struct TrackerCache {
    install: Mutex<HashMap<ResourceKey, InstallTracker>>,
    upgrade: Mutex<HashMap<ResourceKey, UpgradeTracker>>,
    uninstall: Mutex<HashMap<ResourceKey, UninstallTracker>>,
    initialized: Mutex<FxHashSet<ResourceKey>>,
    watched: Mutex<FxHashSet<(ResourceKey, String)>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl TrackerCache {
    pub fn new() -> Self { Self::default() }

    pub fn take_install(&self, key: &ResourceKey) -> InstallTracker {
        lock(&self.install).remove(key).unwrap_or_default()
    }

    pub fn put_install(&self, key: &ResourceKey, t: InstallTracker) {
        lock(&self.install).insert(key.clone(), t);
    }

    /// The upgrade tracker for `generation`; progress recorded for another
    /// generation is discarded.
    pub fn take_upgrade(&self, key: &ResourceKey, generation: i64) -> UpgradeTracker {
        match lock(&self.upgrade).remove(key) {
            Some(t) if t.generation == generation => t,
            _ => UpgradeTracker::new(generation),
        }
    }

    pub fn put_upgrade(&self, key: &ResourceKey, t: UpgradeTracker) {
        lock(&self.upgrade).insert(key.clone(), t);
    }

    pub fn take_uninstall(&self, key: &ResourceKey, generation: i64) -> UninstallTracker {
        match lock(&self.uninstall).remove(key) {
            Some(t) if t.generation == generation => t,
            _ => UninstallTracker::new(generation),
        }
    }

    pub fn put_uninstall(&self, key: &ResourceKey, t: UninstallTracker) {
        lock(&self.uninstall).insert(key.clone(), t);
    }

    pub fn has_uninstall(&self, key: &ResourceKey) -> bool {
        lock(&self.uninstall).contains_key(key)
    }

    pub fn has_upgrade(&self, key: &ResourceKey) -> bool {
        lock(&self.upgrade).contains_key(key)
    }

    /// Drop every lifecycle tracker of `key`.
    pub fn reset(&self, key: &ResourceKey) {
        lock(&self.install).remove(key);
        lock(&self.upgrade).remove(key);
        lock(&self.uninstall).remove(key);
    }

    /// Drop everything known about `key`, including its initialized mark.
    pub fn forget(&self, key: &ResourceKey) {
        self.reset(key);
        lock(&self.initialized).remove(key);
        lock(&self.watched).retain(|(k, _)| k != key);
    }

    /// Mark `key` initialized in this process; true the first time.
    pub fn mark_initialized(&self, key: &ResourceKey) -> bool {
        lock(&self.initialized).insert(key.clone())
    }

    pub fn unmark_initialized(&self, key: &ResourceKey) {
        lock(&self.initialized).remove(key);
    }

    pub fn known_resources(&self) -> Vec<ResourceKey> {
        let mut v: Vec<ResourceKey> = lock(&self.initialized).iter().cloned().collect();
        v.sort();
        v
    }

    pub fn mark_watched(&self, key: &ResourceKey, component: &str) {
        lock(&self.watched).insert((key.clone(), component.to_string()));
    }

    pub fn is_watched(&self, key: &ResourceKey, component: &str) -> bool {
        lock(&self.watched).contains(&(key.clone(), component.to_string()))
    }

    /// Consume a pending watched-resource trigger for `component`.
    pub fn take_watched(&self, key: &ResourceKey, component: &str) -> bool {
        lock(&self.watched).remove(&(key.clone(), component.to_string()))
    }
}
