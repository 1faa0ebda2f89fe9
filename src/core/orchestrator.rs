//! Stateful event router.
//!
//! An [`Orchestrator`] owns a state value, dispatches jobs, and classifies
//! every bus event as *active* (belongs to a job this instance dispatched) or
//! *passive* (everything else). Active ids enter the correlation set at
//! dispatch time and leave it exactly once, on their terminal event.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::domain::{DurablePayload, Event, EventKind, Job, JobId, JobPayload, Progress};

use super::bus::BusError;
use super::dispatcher::{DispatchError, Dispatcher};

/// Errors raised by orchestrator operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Orchestrator has been disposed")]
    Disposed,

    #[error("Orchestrator requires a running Tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Application logic reacting to routed events.
///
/// Every hook defaults to doing nothing. Active hooks fire only for jobs
/// dispatched through the owning orchestrator; `on_passive_event` receives
/// terminal and domain events of everyone else. Terminal and domain events of
/// active jobs fire their specific hook, then `on_active_event`.
///
/// Hooks run outside the routing lock and may call back into the owning
/// orchestrator (`is_active`, `dispatch`, `dispose`). They must not call
/// `state()`: the state is already lent to them mutably.
#[allow(unused_variables)]
pub trait Reactor: Send + Sync + 'static {
    type State: Clone + Send + Sync + 'static;

    fn on_active_started(&self, state: &mut Self::State, event: &Event) {}

    fn on_active_progress(&self, state: &mut Self::State, event: &Event, progress: &Progress) {}

    fn on_active_retrying(&self, state: &mut Self::State, event: &Event, attempt: u32, last_error: &str) {}

    fn on_active_cache_hit(&self, state: &mut Self::State, event: &Event, data: &Value) {}

    fn on_active_placeholder(&self, state: &mut Self::State, event: &Event, data: &Value) {}

    fn on_active_success(&self, state: &mut Self::State, event: &Event, data: &Value) {}

    fn on_active_failure(&self, state: &mut Self::State, event: &Event, error: &str, was_retried: bool) {}

    fn on_active_cancelled(&self, state: &mut Self::State, event: &Event, reason: Option<&str>) {}

    fn on_active_timeout(&self, state: &mut Self::State, event: &Event, duration: Duration) {}

    fn on_active_domain(&self, state: &mut Self::State, event: &Event, name: &str, payload: &Value) {}

    fn on_active_event(&self, state: &mut Self::State, event: &Event) {}

    fn on_passive_event(&self, state: &mut Self::State, event: &Event) {}
}

#[derive(Default)]
struct Routing {
    active: HashSet<JobId>,
}

/// Where an event goes once classified
enum Route {
    /// Non-terminal event of an active job
    ActiveUpdate,
    /// Terminal or domain event of an active job; the id is already retired
    ActiveFinal,
    Passive,
}

struct Inner<R: Reactor> {
    dispatcher: Arc<Dispatcher>,
    reactor: R,
    state: watch::Sender<R::State>,
    routing: Mutex<Routing>,
    /// Written under the routing lock
    disposed: AtomicBool,
}

impl<R: Reactor> Inner<R> {
    fn routing(&self) -> MutexGuard<'_, Routing> {
        self.routing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Classify an event, retiring its id when it ends an active job.
    /// `None` means nothing should see it.
    fn route(&self, event: &Event) -> Option<Route> {
        let mut routing = self.routing();
        let active_id = event
            .correlation_id
            .as_ref()
            .filter(|id| routing.active.contains(*id))
            .cloned();
        let update = matches!(
            event.kind,
            EventKind::Started
                | EventKind::Progress(_)
                | EventKind::Retrying { .. }
                | EventKind::CacheHit { .. }
                | EventKind::Placeholder { .. }
        );

        match (active_id, update) {
            (Some(_), true) => Some(Route::ActiveUpdate),
            (Some(id), false) => {
                trace!(job_id = %id, kind = event.kind.name(), "Active event");
                routing.active.remove(&id);
                Some(Route::ActiveFinal)
            }
            (None, true) => None,
            (None, false) => Some(Route::Passive),
        }
    }

    /// Route one event. Returns false once disposed.
    fn handle(&self, event: &Event) -> bool {
        if self.is_disposed() {
            return false;
        }
        let Some(route) = self.route(event) else {
            return true;
        };
        let reactor = &self.reactor;

        self.state.send_if_modified(|state| {
            // Nothing mutates state once dispose has returned
            if self.is_disposed() {
                return false;
            }
            match route {
                Route::ActiveUpdate => match &event.kind {
                    EventKind::Started => reactor.on_active_started(state, event),
                    EventKind::Progress(progress) => reactor.on_active_progress(state, event, progress),
                    EventKind::Retrying {
                        attempt, last_error, ..
                    } => reactor.on_active_retrying(state, event, *attempt, last_error),
                    EventKind::CacheHit { data } => reactor.on_active_cache_hit(state, event, data),
                    EventKind::Placeholder { data } => reactor.on_active_placeholder(state, event, data),
                    _ => {}
                },
                Route::ActiveFinal => {
                    match &event.kind {
                        EventKind::Success { data } => reactor.on_active_success(state, event, data),
                        EventKind::Failure { error, was_retried } => {
                            reactor.on_active_failure(state, event, error, *was_retried)
                        }
                        EventKind::Cancelled { reason } => reactor.on_active_cancelled(state, event, reason.as_deref()),
                        EventKind::Timeout { duration_ms } => {
                            reactor.on_active_timeout(state, event, Duration::from_millis(*duration_ms))
                        }
                        EventKind::Domain { name, payload } => reactor.on_active_domain(state, event, name, payload),
                        _ => {}
                    }
                    reactor.on_active_event(state, event);
                }
                Route::Passive => reactor.on_passive_event(state, event),
            }
            true
        });

        !self.is_disposed()
    }
}

/// Event-routing state machine bound to one dispatcher and its bus
pub struct Orchestrator<R: Reactor> {
    inner: Arc<Inner<R>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Reactor> Orchestrator<R> {
    /// Subscribe to the dispatcher's bus and start routing events.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(dispatcher: Arc<Dispatcher>, reactor: R, initial: R::State) -> Result<Self, OrchestratorError> {
        let runtime = Handle::try_current().map_err(|_| OrchestratorError::NoRuntime)?;
        let mut subscription = dispatcher.bus().subscribe()?;
        let (state, _) = watch::channel(initial);

        let inner = Arc::new(Inner {
            dispatcher,
            reactor,
            state,
            routing: Mutex::new(Routing::default()),
            disposed: AtomicBool::new(false),
        });

        let listener = {
            let inner = Arc::clone(&inner);
            runtime.spawn(async move {
                while let Some(event) = subscription.recv().await {
                    if !inner.handle(&event) {
                        break;
                    }
                }
                debug!("Orchestrator listener stopped");
            })
        };

        Ok(Self {
            inner,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Dispatch a job and track its events as active
    pub fn dispatch<P: JobPayload>(&self, job: Job<P>) -> Result<JobId, OrchestratorError> {
        let id = self.track(job.id())?;
        self.inner.dispatcher.dispatch(job).map_err(|e| self.untrack(&id, e))
    }

    /// Durable variant of [`dispatch`](Self::dispatch)
    pub async fn dispatch_durable<P: DurablePayload>(&self, job: Job<P>) -> Result<JobId, OrchestratorError> {
        let id = self.track(job.id())?;
        self.inner
            .dispatcher
            .dispatch_durable(job)
            .await
            .map_err(|e| self.untrack(&id, e))
    }

    fn track(&self, id: &JobId) -> Result<JobId, OrchestratorError> {
        let mut routing = self.inner.routing();
        if self.inner.is_disposed() {
            return Err(OrchestratorError::Disposed);
        }
        routing.active.insert(id.clone());
        Ok(id.clone())
    }

    fn untrack(&self, id: &JobId, error: DispatchError) -> OrchestratorError {
        self.inner.routing().active.remove(id);
        error.into()
    }

    /// Snapshot of the current state
    pub fn state(&self) -> R::State {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified after every routed event that reached a hook
    pub fn subscribe_state(&self) -> watch::Receiver<R::State> {
        self.inner.state.subscribe()
    }

    pub fn reactor(&self) -> &R {
        &self.inner.reactor
    }

    pub fn is_active(&self, id: &JobId) -> bool {
        self.inner.routing().active.contains(id)
    }

    pub fn active_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.inner.routing().active.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Stop routing, drop the bus subscription and forget active ids.
    /// Idempotent.
    pub fn dispose(&self) {
        {
            let mut routing = self.inner.routing();
            if self.inner.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
            routing.active.clear();
        }

        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(listener) = listener {
            listener.abort();
        }
        debug!("Orchestrator disposed");
    }
}

impl<R: Reactor> Drop for Orchestrator<R> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bus::SignalBus;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Log {
        active: Vec<String>,
        passive: Vec<String>,
    }

    impl Reactor for Recorder {
        type State = Log;

        fn on_active_started(&self, state: &mut Log, _event: &Event) {
            state.active.push("started".to_string());
        }

        fn on_active_success(&self, state: &mut Log, _event: &Event, _data: &Value) {
            state.active.push("success".to_string());
        }

        fn on_active_event(&self, state: &mut Log, event: &Event) {
            state.active.push(format!("any:{}", event.kind.name()));
        }

        fn on_passive_event(&self, state: &mut Log, event: &Event) {
            state.passive.push(event.kind.name().to_string());
        }
    }

    fn inner(active: &[&str]) -> Inner<Recorder> {
        let (state, _) = watch::channel(Log::default());
        Inner {
            dispatcher: Arc::new(Dispatcher::new(SignalBus::new())),
            reactor: Recorder,
            state,
            routing: Mutex::new(Routing {
                active: active.iter().map(|id| JobId::new(*id)).collect(),
            }),
            disposed: AtomicBool::new(false),
        }
    }

    fn event(id: &str, kind: EventKind) -> Event {
        Event::for_job(&JobId::new(id), "test", kind)
    }

    #[test]
    fn test_terminal_event_retires_active_id() {
        let inner = inner(&["mine"]);
        inner.handle(&event("mine", EventKind::Started));
        inner.handle(&event("mine", EventKind::Success { data: json!(1) }));
        // The same id is passive from now on
        inner.handle(&event("mine", EventKind::Success { data: json!(2) }));

        let log = inner.state.borrow().clone();
        assert_eq!(log.active, vec!["started", "success", "any:success"]);
        assert_eq!(log.passive, vec!["success"]);
        assert!(inner.routing().active.is_empty());
    }

    #[test]
    fn test_foreign_non_terminal_events_are_ignored() {
        let inner = inner(&["mine"]);
        inner.handle(&event("theirs", EventKind::Started));
        inner.handle(&event("theirs", EventKind::Progress(Progress::new(0.5))));
        inner.handle(&event("theirs", EventKind::Timeout { duration_ms: 5 }));
        inner.handle(&Event::domain("user.logged_out", json!({})));

        let log = inner.state.borrow().clone();
        assert!(log.active.is_empty());
        assert_eq!(log.passive, vec!["timeout", "domain"]);
    }

    #[test]
    fn test_correlated_domain_event_is_active() {
        let inner = inner(&["mine"]);
        inner.handle(&Event::domain("draft.saved", json!({})).with_correlation(JobId::new("mine")));

        let log = inner.state.borrow().clone();
        assert_eq!(log.active, vec!["any:domain"]);
        assert!(!inner.routing().active.contains(&JobId::new("mine")));
    }

    #[test]
    fn test_disposed_router_ignores_events() {
        let inner = inner(&["mine"]);
        inner.disposed.store(true, Ordering::SeqCst);
        assert!(!inner.handle(&event("mine", EventKind::Started)));
        assert_eq!(*inner.state.borrow(), Log::default());
    }
}
