//! Reconcile outcomes and requeue backoff.

use std::time::Duration;

use rand::Rng;

/// What a dispatch asks of the controller loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    RequeueAfter(Duration),
}

impl Outcome {
    pub fn is_requeue(&self) -> bool {
        matches!(self, Outcome::RequeueAfter(_))
    }

    /// The longer of two requeues; `Done` loses to any requeue.
    pub fn max(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Done, o) | (o, Outcome::Done) => o,
            (Outcome::RequeueAfter(a), Outcome::RequeueAfter(b)) => Outcome::RequeueAfter(a.max(b)),
        }
    }
}

/// Jittered requeue ranges: `short` for ordinary waiting, `long` after
/// upgrade/uninstall hook failures and while paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub short_min: Duration,
    pub short_max: Duration,
    pub long_min: Duration,
    pub long_max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            short_min: Duration::from_secs(3),
            short_max: Duration::from_secs(5),
            long_min: Duration::from_secs(30),
            long_max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn short(&self) -> Outcome {
        Outcome::RequeueAfter(jitter(self.short_min, self.short_max))
    }

    pub fn long(&self) -> Outcome {
        Outcome::RequeueAfter(jitter(self.long_min, self.long_max))
    }
}

fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let ms = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(ms)
}
