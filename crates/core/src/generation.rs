//! Generation tracker: decides whether a component must re-enter its lifecycle.

use crate::condition::{ComponentState, PlatformState};
use crate::status::ComponentStatus;

/// True when `status` must restart its lifecycle for `generation`.
///
/// Never while the platform is Upgrading or Paused. A lifecycle already in
/// flight restarts only when the generation moved past the one it started
/// for; a Ready component restarts when the generation moved past the one it
/// last converged at.
pub fn needs_reentry(status: &ComponentStatus, generation: i64, platform: PlatformState) -> bool {
    needs_reentry_with(status, generation, platform, false)
}

/// Same as [`needs_reentry`], with an extra trigger from a watched resource
/// belonging to the component.
pub fn needs_reentry_with(status: &ComponentStatus, generation: i64, platform: PlatformState, watched_change: bool) -> bool {
    if matches!(platform, PlatformState::Upgrading | PlatformState::Paused) {
        return false;
    }
    if status.reconciling_generation > 0 {
        return generation > status.reconciling_generation;
    }
    status.state == ComponentState::Ready && (generation > status.last_reconciled_generation || watched_change)
}
