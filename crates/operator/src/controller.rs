//! kube-runtime glue: turns engine outcomes into controller actions.

use std::sync::Arc;
use std::time::Duration;

use keel_core::{Outcome, Platform, ResourceKey, WATCH_LABEL};
use keel_engine::{Reconciler, TrackerCache};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("platform {0} is not namespaced")]
    MissingNamespace(String),
}

pub struct State {
    pub reconciler: Reconciler,
    /// Delay before retrying after a reconcile error.
    pub retry: Duration,
}

pub fn action_for(out: Outcome) -> Action {
    match out {
        Outcome::Done => Action::await_change(),
        Outcome::RequeueAfter(d) => Action::requeue(d),
    }
}

pub async fn reconcile(p: Arc<Platform>, state: Arc<State>) -> Result<Action, OperatorError> {
    let Some(ns) = p.namespace() else {
        return Err(OperatorError::MissingNamespace(p.name_any()));
    };
    let key = ResourceKey::new(ns, p.name_any());
    Ok(action_for(state.reconciler.dispatch(&key).await))
}

pub fn error_policy(p: Arc<Platform>, err: &OperatorError, state: Arc<State>) -> Action {
    warn!(platform = %p.name_any(), error = %err, "reconcile failed");
    metrics::counter!("keel_reconcile_errors_total", 1u64);
    Action::requeue(state.retry)
}

/// Map a change to a labelled ConfigMap or Secret onto every known platform,
/// recording which component it belongs to.
pub fn watched_trigger<O>(trackers: Arc<TrackerCache>) -> impl Fn(O) -> Vec<ObjectRef<Platform>> + Send + Sync + 'static
where
    O: Resource,
{
    move |obj: O| {
        let Some(component) = obj.labels().get(WATCH_LABEL).cloned() else { return Vec::new() };
        trackers
            .known_resources()
            .into_iter()
            .map(|key| {
                trackers.mark_watched(&key, &component);
                ObjectRef::new(&key.name).within(&key.namespace)
            })
            .collect()
    }
}
