//! Keel configuration: operator settings from the environment, the platform
//! manifest (component versions and charts), and profile merging into the
//! effective spec.

#![forbid(unsafe_code)]

mod manifest;
mod profile;
mod settings;

pub use manifest::{Manifest, ManifestComponent};
pub use profile::{merge_values, EffectiveConfigResolver, ProfileResolver};
pub use settings::Settings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error("invalid profile {profile}: {reason}")]
    Profile { profile: String, reason: String },
    #[error("cannot merge spec: {0}")]
    Merge(String),
}
