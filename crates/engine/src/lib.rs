//! Keel reconciliation engine.
//!
//! [`Reconciler::dispatch`] is the single entry point: it fetches the
//! `Platform`, runs the handler for its top-level state and returns an
//! [`Outcome`]. Handlers drive the per-component install, upgrade and
//! uninstall machines over the catalog in declaration order.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use keel_catalog::Catalog;
use keel_config::{EffectiveConfigResolver, Manifest, Settings};
use keel_core::{Outcome, ResourceKey, SemVersion};
use keel_kubehub::ClusterClient;
use keel_status::{Handoff, StatusWriter};
use tracing::{info, info_span, warn, Instrument};

mod dispatcher;
mod install;
mod pass;
mod probe;
pub mod tracker;
mod uninstall;
mod upgrade;

pub use probe::PlatformProbe;
pub use tracker::TrackerCache;

use pass::Pass;

/// Collaborators the reconciler is built from.
pub struct EngineParts {
    pub catalog: Arc<Catalog>,
    pub cluster: Arc<dyn ClusterClient>,
    pub writer: Arc<dyn StatusWriter>,
    pub resolver: Arc<dyn EffectiveConfigResolver>,
    pub manifest: Arc<Manifest>,
    pub settings: Settings,
}

pub struct Reconciler {
    catalog: Arc<Catalog>,
    cluster: Arc<dyn ClusterClient>,
    writer: Arc<dyn StatusWriter>,
    resolver: Arc<dyn EffectiveConfigResolver>,
    manifest: Arc<Manifest>,
    settings: Settings,
    operator_version: SemVersion,
    trackers: Arc<TrackerCache>,
    handoff: Option<Arc<Handoff>>,
}

impl Reconciler {
    pub fn new(parts: EngineParts, trackers: Arc<TrackerCache>) -> Result<Self> {
        let operator_version = match parts.settings.operator_version.as_deref() {
            Some(v) => SemVersion::parse(v).with_context(|| format!("parsing operator version {v}"))?,
            None => parts.manifest.semver().context("parsing manifest version")?,
        };
        info!(operator_version = %operator_version, components = parts.catalog.len(), "reconciler ready");
        Ok(Self {
            catalog: parts.catalog,
            cluster: parts.cluster,
            writer: parts.writer,
            resolver: parts.resolver,
            manifest: parts.manifest,
            settings: parts.settings,
            operator_version,
            trackers,
            handoff: None,
        })
    }

    /// Fold availability snapshots handed off by the poller into dispatches.
    pub fn with_handoff(mut self, handoff: Arc<Handoff>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    pub fn trackers(&self) -> &Arc<TrackerCache> {
        &self.trackers
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn operator_version(&self) -> &SemVersion {
        &self.operator_version
    }

    /// Reconcile one resource. Never fails: every problem becomes a requeue.
    pub async fn dispatch(&self, key: &ResourceKey) -> Outcome {
        let t0 = Instant::now();
        let span = info_span!("dispatch", resource = %key);
        let out = self.dispatch_inner(key).instrument(span).await;
        metrics::counter!("keel_dispatch_total", 1u64);
        metrics::histogram!("keel_dispatch_latency_ms", t0.elapsed().as_millis() as f64);
        out
    }

    async fn dispatch_inner(&self, key: &ResourceKey) -> Outcome {
        let platform = match self.cluster.get_platform(key).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                info!("resource gone; dropping trackers");
                self.trackers.forget(key);
                return Outcome::Done;
            }
            Err(e) => {
                warn!(error = %e, "fetching resource failed");
                return self.settings.backoff.short();
            }
        };
        if platform.deletion_requested() && !platform.has_finalizer() {
            self.trackers.forget(key);
            return Outcome::Done;
        }
        if self.trackers.mark_initialized(key) {
            if let Err(e) = self.initialize(key, platform.deletion_requested()).await {
                warn!(error = %e, "one-time initialization failed");
                self.trackers.unmark_initialized(key);
                return self.settings.backoff.short();
            }
        }
        if !platform.deletion_requested() {
            // recreated if someone removed it
            if let Err(e) = self.cluster.ensure_lifecycle_account(key).await {
                warn!(error = %e, "ensuring lifecycle account failed");
                return self.settings.backoff.short();
            }
        }
        let effective = match self.resolver.resolve(&platform.spec) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "resolving effective configuration failed");
                return self.settings.backoff.short();
            }
        };
        let mut pass = Pass::new(self, platform, effective);
        pass.absorb_availability().await;
        pass.run().await
    }

    /// First sight of a resource in this process.
    async fn initialize(&self, key: &ResourceKey, deleting: bool) -> Result<()> {
        if !deleting {
            self.cluster.add_finalizer(key).await.context("adding finalizer")?;
        }
        info!("resource initialized");
        Ok(())
    }
}
