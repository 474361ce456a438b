//! Keel core types: the `Platform` resource, conditions, lifecycle states,
//! the status projector and the generation tracker.

#![forbid(unsafe_code)]

pub mod condition;
pub mod generation;
pub mod outcome;
pub mod resource;
pub mod status;
pub mod version;

pub use condition::{Condition, ConditionKind, ConditionStatus, ComponentState, PlatformState};
pub use generation::{needs_reentry, needs_reentry_with};
pub use outcome::{Backoff, Outcome};
pub use resource::{ComponentToggle, InstanceInfo, Platform, PlatformSpec, PlatformStatus, Profile, ResourceKey};
pub use status::{ComponentDelta, ComponentStatus, UpdateEvent};
pub use version::{SemVersion, VersionError};

/// Finalizer the engine owns on every `Platform`.
pub const FINALIZER: &str = "keel.dev/lifecycle";

/// Annotation a user bumps to re-attempt a failed lifecycle.
pub const RETRY_ANNOTATION: &str = "keel.dev/retry";

/// Label put on ConfigMaps/Secrets whose changes should re-trigger a component.
pub const WATCH_LABEL: &str = "keel.dev/component";

pub mod prelude {
    pub use super::{
        Backoff, ComponentState, ComponentStatus, Condition, ConditionKind, Outcome, Platform, PlatformSpec,
        PlatformState, PlatformStatus, ResourceKey, SemVersion, UpdateEvent,
    };
}
