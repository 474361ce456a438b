use std::collections::HashMap;

use keel_core::{PlatformSpec, Profile};
use serde_json::Value;
use tracing::debug;

use crate::ConfigError;

/// Turns the raw spec into the effective spec components see.
pub trait EffectiveConfigResolver: Send + Sync {
    fn resolve(&self, spec: &PlatformSpec) -> Result<PlatformSpec, ConfigError>;
}

/// Deep-merges `overlay` into `base`: objects merge key by key, anything
/// else in `overlay` replaces what `base` holds. Nulls in `overlay` are ignored.
pub fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(b), Value::Object(o)) => {
            for (k, v) in o {
                match b.get_mut(k) {
                    Some(slot) => merge_values(slot, v),
                    None => {
                        if !v.is_null() {
                            b.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
        }
        (b, o) => *b = o.clone(),
    }
}

/// Resolver backed by the built-in profiles: the selected profile provides
/// defaults, the user's spec wins.
pub struct ProfileResolver {
    profiles: HashMap<Profile, Value>,
}

const DEV: &str = include_str!("../profiles/dev.yaml");
const PROD: &str = include_str!("../profiles/prod.yaml");
const MANAGED: &str = include_str!("../profiles/managed-cluster.yaml");

impl ProfileResolver {
    pub fn builtin() -> Result<Self, ConfigError> {
        let mut profiles = HashMap::new();
        for (p, raw) in [(Profile::Dev, DEV), (Profile::Prod, PROD), (Profile::ManagedCluster, MANAGED)] {
            let v: Value = serde_yaml::from_str(raw)
                .map_err(|e| ConfigError::Profile { profile: p.as_str().to_string(), reason: e.to_string() })?;
            profiles.insert(p, v);
        }
        Ok(Self { profiles })
    }
}

impl EffectiveConfigResolver for ProfileResolver {
    fn resolve(&self, spec: &PlatformSpec) -> Result<PlatformSpec, ConfigError> {
        let profile = spec.profile.unwrap_or_default();
        let mut merged = self.profiles.get(&profile).cloned().unwrap_or_else(|| Value::Object(Default::default()));
        let overlay = serde_json::to_value(spec).map_err(|e| ConfigError::Merge(e.to_string()))?;
        merge_values(&mut merged, &overlay);
        let mut out: PlatformSpec = serde_json::from_value(merged).map_err(|e| ConfigError::Merge(e.to_string()))?;
        out.profile = Some(profile);
        debug!(profile = %profile.as_str(), components = out.components.len(), "effective spec resolved");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ComponentToggle;
    use serde_json::json;

    #[test]
    fn merge_is_last_write_wins() {
        let mut base = json!({"a": {"x": 1, "y": [1, 2]}, "b": true});
        merge_values(&mut base, &json!({"a": {"y": [3], "z": "n"}, "b": null, "c": 2}));
        assert_eq!(base, json!({"a": {"x": 1, "y": [3], "z": "n"}, "b": true, "c": 2}));
    }

    #[test]
    fn user_toggle_beats_profile() {
        let r = ProfileResolver::builtin().unwrap();
        let mut spec = PlatformSpec { profile: Some(Profile::ManagedCluster), ..Default::default() };
        spec.components.insert("console".into(), ComponentToggle { enabled: Some(true), ..Default::default() });
        let eff = r.resolve(&spec).unwrap();
        assert_eq!(eff.components["console"].enabled, Some(true));
        assert_eq!(eff.components["identity"].enabled, Some(false));
    }

    #[test]
    fn defaults_to_prod_and_keeps_overrides() {
        let r = ProfileResolver::builtin().unwrap();
        let mut spec = PlatformSpec::default();
        spec.components.insert(
            "identity-db".into(),
            ComponentToggle { overrides: Some(json!({"storage": "10Gi"})), ..Default::default() },
        );
        let eff = r.resolve(&spec).unwrap();
        assert_eq!(eff.profile, Some(Profile::Prod));
        assert_eq!(eff.components["identity-db"].overrides, Some(json!({"replicas": 3, "storage": "10Gi"})));
    }
}
