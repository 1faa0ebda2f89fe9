//! Executor pipeline.
//!
//! Wraps registered business logic with the cross-cutting policies every job
//! gets: the pre-start cancellation check, cache lookup, the race between the
//! business call, its timeout and its cancellation token, retry with
//! exponential backoff, and the error boundary. Each run produces exactly one
//! [`Outcome`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::job::duration_millis;
use crate::domain::{Event, EventKind, Job, JobId, JobPayload, Progress};

use super::bus::SignalBus;
use super::cache::CacheProvider;
use super::cancellation::{CancellationToken, Cancelled};
use super::retry::RetryPolicy;

/// Business logic registered for one job kind
#[async_trait]
pub trait Executor<P: JobPayload>: Send + Sync + 'static {
    /// Execute the job once. Errors are retried according to the job's policy.
    async fn process(&self, job: &Job<P>, ctx: &JobContext) -> Result<Value, JobError>;
}

/// Errors returned from [`Executor::process`]
#[derive(Debug, Error)]
pub enum JobError {
    /// Business logic observed a cancelled token
    #[error("{0}")]
    Cancelled(#[from] Cancelled),

    #[error("{0}")]
    Failed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Final result of one pipeline run
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure { error: String, was_retried: bool },
    Cancelled { reason: Option<String> },
    Timeout { duration: Duration },
}

impl Outcome {
    /// The terminal event kind announcing this outcome
    pub fn to_event_kind(&self) -> EventKind {
        match self {
            Self::Success(data) => EventKind::Success { data: data.clone() },
            Self::Failure { error, was_retried } => EventKind::Failure {
                error: error.clone(),
                was_retried: *was_retried,
            },
            Self::Cancelled { reason } => EventKind::Cancelled {
                reason: reason.clone(),
            },
            Self::Timeout { duration } => EventKind::Timeout {
                duration_ms: duration_millis(*duration),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Closes once the terminal outcome is decided. Non-terminal emissions after
/// that point are discarded, and only the first close may emit.
#[derive(Clone, Default)]
struct TerminalLatch {
    closed: Arc<Mutex<bool>>,
}

impl TerminalLatch {
    fn emit_non_terminal(&self, bus: &SignalBus, event: Event) -> bool {
        let closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return false;
        }
        bus.emit(event);
        true
    }

    fn close(&self, bus: &SignalBus, terminal: Option<Event>) -> bool {
        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return false;
        }
        *closed = true;
        if let Some(event) = terminal {
            bus.emit(event);
        }
        true
    }
}

/// Execution context handed to business logic
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    kind: &'static str,
    attempt: u32,
    cancellation: CancellationToken,
    bus: SignalBus,
    latch: TerminalLatch,
}

impl JobContext {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// 0 for the first attempt, incremented on each retry
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn throw_if_cancelled(&self) -> Result<(), Cancelled> {
        self.cancellation.throw_if_cancelled()
    }

    /// Publish a progress report. Returns false once the job has finished.
    pub fn report_progress(&self, progress: Progress) -> bool {
        let event = Event::for_job(&self.job_id, self.kind, EventKind::Progress(progress));
        self.latch.emit_non_terminal(&self.bus, event)
    }

    pub fn progress(&self, value: f64) -> bool {
        self.report_progress(Progress::new(value))
    }

    /// Publish a free-standing domain event on the bus
    pub fn emit_domain(&self, name: impl Into<String>, payload: Value) {
        self.bus.emit(Event::domain(name, payload));
    }
}

/// Whether the pipeline announces its own terminal event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TerminalMode {
    /// Emit the terminal event on the bus
    Emit,
    /// Return the outcome and let the caller announce it
    Deferred,
}

enum Race {
    Completed(Result<Value, JobError>),
    Panicked(String),
    Cancelled,
    TimedOut(Duration),
}

/// Policy runner shared by all dispatches of one dispatcher
#[derive(Clone)]
pub(crate) struct Pipeline {
    bus: SignalBus,
    cache: Option<Arc<dyn CacheProvider>>,
}

impl Pipeline {
    pub(crate) fn new(bus: SignalBus, cache: Option<Arc<dyn CacheProvider>>) -> Self {
        Self { bus, cache }
    }

    pub(crate) fn bus(&self) -> &SignalBus {
        &self.bus
    }

    /// Run a job to its outcome
    #[instrument(skip_all, fields(job_id = %job.id(), kind = P::KIND))]
    pub(crate) async fn run<P: JobPayload>(
        &self,
        executor: Arc<dyn Executor<P>>,
        job: Arc<Job<P>>,
        mode: TerminalMode,
    ) -> Outcome {
        let token = job.cancellation().cloned().unwrap_or_default();
        let latch = TerminalLatch::default();

        let outcome = self.execute(executor, &job, &token, &latch).await;

        let terminal = match mode {
            TerminalMode::Emit => Some(Event::for_job(job.id(), P::KIND, outcome.to_event_kind())),
            TerminalMode::Deferred => None,
        };
        if !latch.close(&self.bus, terminal) {
            error!("Terminal latch closed twice");
        }

        outcome
    }

    async fn execute<P: JobPayload>(
        &self,
        executor: Arc<dyn Executor<P>>,
        job: &Arc<Job<P>>,
        token: &CancellationToken,
        latch: &TerminalLatch,
    ) -> Outcome {
        if token.is_cancelled() {
            debug!("Job cancelled before start");
            return Outcome::Cancelled {
                reason: token.reason(),
            };
        }

        // A hit only short-circuits when no revalidation is requested
        if let Some(data) = self.cached_result(job, latch) {
            return Outcome::Success(data);
        }

        let policy = job.retry_policy().cloned().unwrap_or_else(RetryPolicy::none);
        let mut attempt = 0u32;

        loop {
            if token.is_cancelled() {
                return Outcome::Cancelled {
                    reason: token.reason(),
                };
            }

            let ctx = JobContext {
                job_id: job.id().clone(),
                kind: P::KIND,
                attempt,
                cancellation: token.clone(),
                bus: self.bus.clone(),
                latch: latch.clone(),
            };

            let task = {
                let executor = Arc::clone(&executor);
                let job = Arc::clone(job);
                tokio::spawn(async move { executor.process(&job, &ctx).await })
            };

            let error = match race(task, job.timeout(), token).await {
                Race::Completed(Ok(data)) => {
                    self.store_result(job, &data);
                    info!(attempt, "Job succeeded");
                    return Outcome::Success(data);
                }
                Race::Completed(Err(JobError::Cancelled(signal))) => {
                    debug!("Business logic observed cancellation");
                    return Outcome::Cancelled {
                        reason: signal.reason.or_else(|| token.reason()),
                    };
                }
                Race::Cancelled => {
                    debug!("Job cancelled while running");
                    return Outcome::Cancelled {
                        reason: token.reason(),
                    };
                }
                Race::TimedOut(duration) => {
                    if !(policy.retry_on_timeout && policy.should_retry(attempt)) {
                        warn!(timeout_ms = duration_millis(duration), "Job timed out");
                        return Outcome::Timeout { duration };
                    }
                    format!("Timed out after {}ms", duration.as_millis())
                }
                Race::Completed(Err(e)) => e.to_string(),
                Race::Panicked(message) => message,
            };

            if !policy.should_retry(attempt) {
                error!(attempt, error = %error, "Job failed permanently");
                return Outcome::Failure {
                    error,
                    was_retried: attempt > 0,
                };
            }

            let delay = policy.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = duration_millis(delay),
                error = %error,
                "Job failed, retrying"
            );
            latch.emit_non_terminal(
                &self.bus,
                Event::for_job(
                    job.id(),
                    P::KIND,
                    EventKind::Retrying {
                        attempt: attempt + 1,
                        max_retries: policy.max_retries,
                        last_error: error,
                        delay_ms: duration_millis(delay),
                    },
                ),
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Job cancelled during retry delay");
                    return Outcome::Cancelled { reason: token.reason() };
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    /// Serve a cache hit. Returns the data when the hit completes the job.
    fn cached_result<P: JobPayload>(&self, job: &Job<P>, latch: &TerminalLatch) -> Option<Value> {
        let (policy, cache) = match (job.cache_policy(), self.cache.as_ref()) {
            (Some(policy), Some(cache)) => (policy, cache),
            _ => return None,
        };

        let data = cache.read(&policy.key)?;
        debug!(key = %policy.key, "Cache hit");
        latch.emit_non_terminal(
            &self.bus,
            Event::for_job(job.id(), P::KIND, EventKind::CacheHit { data: data.clone() }),
        );

        if policy.revalidate {
            None
        } else {
            Some(data)
        }
    }

    fn store_result<P: JobPayload>(&self, job: &Job<P>, data: &Value) {
        if let (Some(policy), Some(cache)) = (job.cache_policy(), self.cache.as_ref()) {
            cache.write(&policy.key, data.clone(), policy.ttl());
        }
    }
}

/// Race the business task against cancellation and the optional timeout.
/// The losing task keeps running detached; its result is dropped.
async fn race(
    mut task: JoinHandle<Result<Value, JobError>>,
    timeout: Option<Duration>,
    token: &CancellationToken,
) -> Race {
    let deadline = async move {
        match timeout {
            Some(duration) => {
                tokio::time::sleep(duration).await;
                duration
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => Race::Cancelled,
        joined = &mut task => match joined {
            Ok(result) => Race::Completed(result),
            Err(e) if e.is_panic() => Race::Panicked("Executor panicked".to_string()),
            Err(e) => Race::Panicked(e.to_string()),
        },
        duration = deadline => Race::TimedOut(duration),
    }
}
