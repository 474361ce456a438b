use std::collections::BTreeMap;
use std::sync::Arc;

use keel_catalog::{Catalog, ComponentContext, Operation};
use keel_config::EffectiveConfigResolver;
use keel_kubehub::ClusterClient;
use keel_status::{AvailabilityProbe, AvailabilitySnapshot};
use tracing::debug;

use crate::TrackerCache;

/// Readiness of the enabled components of every resource this process knows.
pub struct PlatformProbe {
    catalog: Arc<Catalog>,
    cluster: Arc<dyn ClusterClient>,
    resolver: Arc<dyn EffectiveConfigResolver>,
    trackers: Arc<TrackerCache>,
    dry_run: bool,
}

impl PlatformProbe {
    pub fn new(
        catalog: Arc<Catalog>,
        cluster: Arc<dyn ClusterClient>,
        resolver: Arc<dyn EffectiveConfigResolver>,
        trackers: Arc<TrackerCache>,
        dry_run: bool,
    ) -> Self {
        Self { catalog, cluster, resolver, trackers, dry_run }
    }
}

#[async_trait::async_trait]
impl AvailabilityProbe for PlatformProbe {
    async fn probe(&self) -> Vec<AvailabilitySnapshot> {
        let mut out = Vec::new();
        for key in self.trackers.known_resources() {
            let platform = match self.cluster.get_platform(&key).await {
                Ok(Some(p)) if !p.deletion_requested() => p,
                Ok(_) => continue,
                Err(e) => {
                    debug!(resource = %key, error = %e, "availability: fetch failed");
                    continue;
                }
            };
            let Ok(effective) = self.resolver.resolve(&platform.spec) else { continue };
            let ctx = ComponentContext::new(&platform, &effective, Operation::Probe, self.dry_run);
            let mut components = BTreeMap::new();
            for comp in self.catalog.components() {
                if comp.operator_install_supported() && comp.is_enabled(&effective) {
                    components.insert(comp.name().to_string(), comp.is_ready(&ctx).await);
                }
            }
            out.push(AvailabilitySnapshot { key, components });
        }
        out
    }
}
