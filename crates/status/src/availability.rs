//! Periodic availability polling with an acknowledgment-gated hand-off to the
//! reconcile loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_core::{status::ComponentDelta, ResourceKey, UpdateEvent};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::StatusWriter;

#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilitySnapshot {
    pub key: ResourceKey,
    /// Readiness of each enabled component.
    pub components: BTreeMap<String, bool>,
}

impl AvailabilitySnapshot {
    pub fn summary(&self) -> String {
        let ready = self.components.values().filter(|r| **r).count();
        format!("{}/{}", ready, self.components.len())
    }

    pub fn to_event(&self) -> UpdateEvent {
        let mut ev = UpdateEvent::new(self.key.clone());
        ev.available = Some(self.summary());
        for (name, ready) in &self.components {
            ev.components.insert(name.clone(), ComponentDelta::Available(*ready));
        }
        ev
    }
}

#[async_trait::async_trait]
pub trait AvailabilityProbe: Send + Sync {
    async fn probe(&self) -> Vec<AvailabilitySnapshot>;
}

#[derive(Debug, PartialEq)]
pub enum Offer {
    Delivered,
    /// The reader has not taken or acknowledged the previous snapshot; the
    /// caller writes this one itself.
    Fallback(AvailabilitySnapshot),
}

/// Single-slot hand-off. A new snapshot is only handed over once the previous
/// one was acknowledged, so the poller never blocks on a busy reader.
pub struct Handoff {
    tx: mpsc::Sender<AvailabilitySnapshot>,
    rx: Mutex<mpsc::Receiver<AvailabilitySnapshot>>,
    awaiting_ack: AtomicBool,
}

impl Handoff {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        Arc::new(Self { tx, rx: Mutex::new(rx), awaiting_ack: AtomicBool::new(false) })
    }

    pub fn offer(&self, snap: AvailabilitySnapshot) -> Offer {
        if self.awaiting_ack.load(Ordering::SeqCst) {
            return self.supersede(snap);
        }
        match self.tx.try_send(snap) {
            Ok(()) => {
                self.awaiting_ack.store(true, Ordering::SeqCst);
                Offer::Delivered
            }
            Err(TrySendError::Full(s)) | Err(TrySendError::Closed(s)) => Offer::Fallback(s),
        }
    }

    /// A snapshot still sitting in the slot for the same resource is stale
    /// once a newer one exists: swap it out instead of writing around it.
    fn supersede(&self, snap: AvailabilitySnapshot) -> Offer {
        let Ok(mut rx) = self.rx.lock() else { return Offer::Fallback(snap) };
        match rx.try_recv() {
            Ok(stale) if stale.key == snap.key => match self.tx.try_send(snap) {
                Ok(()) => Offer::Delivered,
                Err(TrySendError::Full(s)) | Err(TrySendError::Closed(s)) => Offer::Fallback(s),
            },
            Ok(other) => {
                // the slot was just emptied under the lock
                let _ = self.tx.try_send(other);
                Offer::Fallback(snap)
            }
            Err(_) => Offer::Fallback(snap),
        }
    }

    /// Reader side: take the pending snapshot, if any. Must be followed by
    /// [`Handoff::acknowledge`] once it has been folded into a status write.
    pub fn take(&self) -> Option<AvailabilitySnapshot> {
        self.rx.lock().ok().and_then(|mut rx| rx.try_recv().ok())
    }

    pub fn acknowledge(&self) {
        self.awaiting_ack.store(false, Ordering::SeqCst);
    }
}

/// Spawn the poller: every `every`, probe and offer each snapshot; snapshots
/// that cannot be handed off are written directly.
pub fn spawn_poller(
    probe: Arc<dyn AvailabilityProbe>,
    handoff: Arc<Handoff>,
    writer: Arc<dyn StatusWriter>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            for snap in probe.probe().await {
                match handoff.offer(snap) {
                    Offer::Delivered => debug!("availability: snapshot handed off"),
                    Offer::Fallback(s) => {
                        metrics::counter!("keel_availability_fallback_total", 1u64);
                        debug!(resource = %s.key, available = %s.summary(), "availability: writing directly");
                        writer.update(s.to_event()).await;
                    }
                }
            }
        }
    })
}
