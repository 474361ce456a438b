//! Keel status: the writer that persists engine status updates, and the
//! availability poller that feeds it.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use keel_core::{ResourceKey, UpdateEvent};
use keel_kubehub::{ClientError, ClusterClient};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod availability;

pub use availability::{spawn_poller, AvailabilityProbe, AvailabilitySnapshot, Handoff, Offer};

/// Sink for status update events. Implementations own write-conflict retry.
#[async_trait::async_trait]
pub trait StatusWriter: Send + Sync {
    async fn update(&self, event: UpdateEvent);
}

/// Coalescing queue keyed by resource: events for a resource already queued
/// are merged into the queued one, keeping first-seen order.
pub struct Coalescer {
    map: FxHashMap<ResourceKey, UpdateEvent>,
    order: VecDeque<ResourceKey>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new() }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn push(&mut self, ev: UpdateEvent) {
        match self.map.get_mut(&ev.key) {
            Some(cur) => cur.merge(ev),
            None => {
                self.order.push_back(ev.key.clone());
                self.map.insert(ev.key.clone(), ev);
            }
        }
    }

    pub fn drain_ready(&mut self) -> Vec<UpdateEvent> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(k) = self.order.pop_front() {
            if let Some(ev) = self.map.remove(&k) {
                out.push(ev);
            }
        }
        out
    }
}

impl Default for Coalescer {
    fn default() -> Self { Self::new() }
}

/// Read the live object, apply `event` to its status and replace the status
/// subresource, re-reading on conflict up to `retries` times.
pub async fn apply_with_retry(client: &dyn ClusterClient, event: &UpdateEvent, retries: usize) -> Result<(), ClientError> {
    let mut attempt = 0usize;
    loop {
        let Some(mut platform) = client.get_platform(&event.key).await? else {
            debug!(resource = %event.key, "status: resource gone, dropping update");
            return Ok(());
        };
        event.apply_to(platform.status_mut());
        match client.replace_status(&platform).await {
            Ok(_) => return Ok(()),
            Err(ClientError::Conflict(msg)) if attempt < retries => {
                attempt += 1;
                metrics::counter!("keel_status_conflicts_total", 1u64);
                debug!(resource = %event.key, attempt, error = %msg, "status: conflict, retrying");
                tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Queue-backed writer talking to the API server through a `ClusterClient`.
#[derive(Clone)]
pub struct KubeStatusWriter {
    tx: mpsc::Sender<UpdateEvent>,
}

#[async_trait::async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn update(&self, event: UpdateEvent) {
        if event.is_empty() {
            return;
        }
        if self.tx.send(event).await.is_err() {
            warn!("status: writer loop stopped, update lost");
        }
    }
}

/// Spawn the writer loop. Events are coalesced per resource and flushed on a
/// short tick; a closed channel flushes what is left and stops the loop.
pub fn spawn_status_writer(client: Arc<dyn ClusterClient>, cap: usize, retries: usize) -> KubeStatusWriter {
    let (tx, mut rx) = mpsc::channel::<UpdateEvent>(cap.max(1));
    tokio::spawn(async move {
        let mut coalescer = Coalescer::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(50));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(ev) => coalescer.push(ev),
                        None => {
                            debug!("status channel closed; draining and exiting writer loop");
                            flush(client.as_ref(), &mut coalescer, retries).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    flush(client.as_ref(), &mut coalescer, retries).await;
                }
            }
        }
        info!("status writer stopped");
    });
    KubeStatusWriter { tx }
}

async fn flush(client: &dyn ClusterClient, coalescer: &mut Coalescer, retries: usize) {
    for ev in coalescer.drain_ready() {
        if let Err(e) = apply_with_retry(client, &ev, retries).await {
            warn!(resource = %ev.key, error = %e, "status: update failed");
        }
    }
}
