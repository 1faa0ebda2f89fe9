//! Kind-keyed executor registry and the job submission entry point.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use crate::domain::{DurablePayload, Event, EventKind, Job, JobId, JobPayload, SerializedJob};
use crate::offline::{OfflineQueue, QueueError, QueuedJob, QueuedJobStatus};

use super::bus::SignalBus;
use super::cache::CacheProvider;
use super::pipeline::{Executor, Outcome, Pipeline, TerminalMode};
use super::retry::RetryPolicy;

static GLOBAL_DISPATCHER: OnceLock<Arc<Dispatcher>> = OnceLock::new();

/// Errors returned synchronously from dispatch
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No executor registered for job kind '{kind}'")]
    ExecutorNotFound { kind: String },

    #[error("Executor registered for '{kind}' handles a different payload type")]
    PayloadMismatch { kind: String },

    #[error("Job kind '{kind}' is not registered for offline replay")]
    NotDurable { kind: String },

    #[error("Dispatch requires a running Tokio runtime")]
    NoRuntime,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Runs a persisted job of one kind through the pipeline
#[async_trait]
trait ReplayJob: Send + Sync {
    async fn replay(
        &self,
        pipeline: &Pipeline,
        job: &SerializedJob,
        default_retry: Option<&RetryPolicy>,
    ) -> Result<Outcome, DispatchError>;
}

struct DurableReplayer<P: JobPayload> {
    executor: Arc<dyn Executor<P>>,
}

#[async_trait]
impl<P: DurablePayload> ReplayJob for DurableReplayer<P> {
    async fn replay(
        &self,
        pipeline: &Pipeline,
        job: &SerializedJob,
        default_retry: Option<&RetryPolicy>,
    ) -> Result<Outcome, DispatchError> {
        let job = with_default_retry(job.decode::<P>()?, default_retry);
        Ok(pipeline
            .run(Arc::clone(&self.executor), Arc::new(job), TerminalMode::Deferred)
            .await)
    }
}

struct Registration {
    /// `Arc<dyn Executor<P>>` for the payload type registered under this kind
    executor: Arc<dyn Any + Send + Sync>,
    replayer: Option<Arc<dyn ReplayJob>>,
}

/// Routes jobs to the executor registered for their kind
pub struct Dispatcher {
    registry: RwLock<HashMap<&'static str, Registration>>,
    pipeline: Pipeline,
    offline: Option<Arc<OfflineQueue>>,
    default_retry: Option<RetryPolicy>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("kinds", &self.registered_kinds())
            .field("offline", &self.offline.is_some())
            .field("default_retry", &self.default_retry)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher publishing on `bus`
    pub fn new(bus: SignalBus) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            pipeline: Pipeline::new(bus, None),
            offline: None,
            default_retry: None,
        }
    }

    /// The process-wide dispatcher, bound to [`SignalBus::global`]
    pub fn global() -> Arc<Dispatcher> {
        GLOBAL_DISPATCHER
            .get_or_init(|| Arc::new(Self::new(SignalBus::global())))
            .clone()
    }

    /// Serve and store results of jobs that carry a cache policy
    pub fn with_cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.pipeline = Pipeline::new(self.pipeline.bus().clone(), Some(cache));
        self
    }

    /// Enable durable dispatch through an offline queue
    pub fn with_offline_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
        self.offline = Some(queue);
        self
    }

    /// Retry policy for jobs that don't carry one
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = Some(policy);
        self
    }

    pub fn bus(&self) -> &SignalBus {
        self.pipeline.bus()
    }

    pub fn offline_queue(&self) -> Option<&Arc<OfflineQueue>> {
        self.offline.as_ref()
    }

    /// Register the executor for `P`. A later registration for the same kind
    /// replaces this one.
    pub fn register<P: JobPayload>(&self, executor: impl Executor<P>) {
        let executor: Arc<dyn Executor<P>> = Arc::new(executor);
        self.insert::<P>(executor, None);
    }

    /// Register the executor for `P` and allow its jobs to be parked in the
    /// offline queue and replayed after a restart
    pub fn register_durable<P: DurablePayload>(&self, executor: impl Executor<P>) {
        let executor: Arc<dyn Executor<P>> = Arc::new(executor);
        let replayer: Arc<dyn ReplayJob> = Arc::new(DurableReplayer {
            executor: Arc::clone(&executor),
        });
        self.insert::<P>(executor, Some(replayer));
    }

    fn insert<P: JobPayload>(&self, executor: Arc<dyn Executor<P>>, replayer: Option<Arc<dyn ReplayJob>>) {
        let registration = Registration {
            executor: Arc::new(executor),
            replayer,
        };
        if self.registry_mut().insert(P::KIND, registration).is_some() {
            debug!(kind = P::KIND, "Replaced registered executor");
        } else {
            debug!(kind = P::KIND, "Registered executor");
        }
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.registry().contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn registered_kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.registry().keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Remove every registration
    pub fn clear(&self) {
        self.registry_mut().clear();
    }

    /// Empty the registry between tests that share a dispatcher
    pub fn reset_for_testing(&self) {
        self.clear();
    }

    /// Submit a job. Emits `Started`, schedules the pipeline on the current
    /// Tokio runtime and returns the correlation id without waiting.
    pub fn dispatch<P: JobPayload>(&self, job: Job<P>) -> Result<JobId, DispatchError> {
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let executor = self.executor::<P>()?;
        let job = with_default_retry(job, self.default_retry.as_ref());
        let id = job.id().clone();

        self.bus().emit(Event::for_job(&id, P::KIND, EventKind::Started));
        debug!(job_id = %id, kind = P::KIND, "Job dispatched");

        let pipeline = self.pipeline.clone();
        runtime.spawn(async move {
            pipeline.run(executor, Arc::new(job), TerminalMode::Emit).await;
        });

        Ok(id)
    }

    /// Submit a job that must survive disconnection and restarts.
    ///
    /// While offline the job is persisted as `pending` before anything is
    /// emitted, so storage errors reach the caller. Online, the job runs
    /// immediately; if it ends in `Failure` it is parked for replay and the
    /// failure is reported as `Retrying` instead. Without an offline queue
    /// this behaves like [`dispatch`](Self::dispatch).
    pub async fn dispatch_durable<P: DurablePayload>(&self, job: Job<P>) -> Result<JobId, DispatchError> {
        let Some(queue) = self.offline.clone() else {
            return self.dispatch(job);
        };

        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let executor = self.executor::<P>()?;
        if !self.is_durable(P::KIND) {
            return Err(DispatchError::NotDurable {
                kind: P::KIND.to_string(),
            });
        }

        let job = with_default_retry(job, self.default_retry.as_ref());
        let id = job.id().clone();
        let serialized = job.to_serialized()?;

        if !queue.is_connected() {
            queue.enqueue(serialized).await?;
            let bus = self.bus();
            bus.emit(Event::for_job(&id, P::KIND, EventKind::Started));
            if let Some(data) = job.placeholder() {
                bus.emit(Event::for_job(&id, P::KIND, EventKind::Placeholder { data: data.clone() }));
            }
            info!(job_id = %id, kind = P::KIND, "Offline, job queued");
            return Ok(id);
        }

        self.bus().emit(Event::for_job(&id, P::KIND, EventKind::Started));

        let pipeline = self.pipeline.clone();
        runtime.spawn(async move {
            let job = Arc::new(job);
            let outcome = pipeline.run(executor, Arc::clone(&job), TerminalMode::Deferred).await;
            let bus = pipeline.bus();

            let (error, was_retried) = match outcome {
                Outcome::Failure { error, was_retried } => (error, was_retried),
                other => {
                    bus.emit(Event::for_job(job.id(), P::KIND, other.to_event_kind()));
                    return;
                }
            };

            match queue.park_failure(serialized, &error).await {
                Ok(parked) if parked.status != QueuedJobStatus::Poisoned => {
                    bus.emit(Event::for_job(
                        job.id(),
                        P::KIND,
                        EventKind::Retrying {
                            attempt: parked.attempt,
                            max_retries: queue.max_attempts().saturating_sub(1),
                            last_error: error,
                            delay_ms: 0,
                        },
                    ));
                    if let Some(data) = job.placeholder() {
                        bus.emit(Event::for_job(
                            job.id(),
                            P::KIND,
                            EventKind::Placeholder { data: data.clone() },
                        ));
                    }
                }
                Ok(_) => {
                    bus.emit(Event::for_job(job.id(), P::KIND, EventKind::Failure { error, was_retried }));
                }
                Err(e) => {
                    error!(job_id = %job.id(), error = %e, "Failed to park job");
                    bus.emit(Event::for_job(job.id(), P::KIND, EventKind::Failure { error, was_retried }));
                }
            }
        });

        Ok(id)
    }

    /// Run a persisted job through the pipeline and return its outcome
    /// without announcing a terminal event
    pub async fn replay_queued(&self, queued: &QueuedJob) -> Result<Outcome, DispatchError> {
        let kind = queued.kind();
        let replayer = {
            let registry = self.registry();
            let registration = registry.get(kind).ok_or_else(|| DispatchError::ExecutorNotFound {
                kind: kind.to_string(),
            })?;
            registration
                .replayer
                .clone()
                .ok_or_else(|| DispatchError::NotDurable { kind: kind.to_string() })?
        };

        replayer
            .replay(&self.pipeline, &queued.job, self.default_retry.as_ref())
            .await
    }

    fn is_durable(&self, kind: &str) -> bool {
        self.registry()
            .get(kind)
            .is_some_and(|registration| registration.replayer.is_some())
    }

    fn executor<P: JobPayload>(&self) -> Result<Arc<dyn Executor<P>>, DispatchError> {
        let registry = self.registry();
        let registration = registry.get(P::KIND).ok_or_else(|| DispatchError::ExecutorNotFound {
            kind: P::KIND.to_string(),
        })?;

        registration
            .executor
            .downcast_ref::<Arc<dyn Executor<P>>>()
            .cloned()
            .ok_or_else(|| DispatchError::PayloadMismatch {
                kind: P::KIND.to_string(),
            })
    }

    fn registry(&self) -> RwLockReadGuard<'_, HashMap<&'static str, Registration>> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, HashMap<&'static str, Registration>> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn with_default_retry<P: JobPayload>(job: Job<P>, default: Option<&RetryPolicy>) -> Job<P> {
    match default {
        Some(policy) if job.retry_policy().is_none() => job.with_retry(policy.clone()),
        _ => job,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::{JobContext, JobError};
    use serde_json::{json, Value};

    struct Ping;
    impl JobPayload for Ping {
        const KIND: &'static str = "test.ping";
    }

    struct Impostor;
    impl JobPayload for Impostor {
        const KIND: &'static str = "test.ping";
    }

    struct Pong;

    #[async_trait]
    impl Executor<Ping> for Pong {
        async fn process(&self, _job: &Job<Ping>, _ctx: &JobContext) -> Result<Value, JobError> {
            Ok(json!("pong"))
        }
    }

    #[test]
    fn test_dispatch_without_runtime() {
        let dispatcher = Dispatcher::new(SignalBus::new());
        dispatcher.register(Pong);
        assert!(matches!(
            dispatcher.dispatch(Job::new(Ping)),
            Err(DispatchError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_kind_collision_is_reported() {
        let dispatcher = Dispatcher::new(SignalBus::new());
        dispatcher.register(Pong);

        let err = dispatcher.dispatch(Job::new(Impostor)).unwrap_err();
        assert!(matches!(err, DispatchError::PayloadMismatch { .. }));
    }

    #[test]
    fn test_registry_bookkeeping() {
        let dispatcher = Dispatcher::new(SignalBus::new());
        assert!(!dispatcher.is_registered("test.ping"));

        dispatcher.register(Pong);
        assert_eq!(dispatcher.registered_kinds(), vec!["test.ping"]);

        dispatcher.reset_for_testing();
        assert!(dispatcher.registered_kinds().is_empty());
    }

    #[test]
    fn test_default_retry_applies_only_when_missing() {
        let default = RetryPolicy::exponential(4, std::time::Duration::from_millis(10));

        let job = with_default_retry(Job::new(Ping), Some(&default));
        assert_eq!(job.retry_policy().map(|p| p.max_retries), Some(4));

        let job = with_default_retry(Job::new(Ping).with_retry(RetryPolicy::none()), Some(&default));
        assert_eq!(job.retry_policy().map(|p| p.max_retries), Some(0));
    }
}
