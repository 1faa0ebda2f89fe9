//! conductor - Event-driven job orchestration
//!
//! Decouples "what needs to happen" (a [`Job`]) from "who reacts to the
//! result" (one or more [`Orchestrator`]s), with cancellation, timeouts,
//! retry with backoff, result caching and durable offline replay.
//!
//! # Architecture
//!
//! - A [`Dispatcher`] routes each job to the [`Executor`] registered for its
//!   kind and runs it through the pipeline
//! - The pipeline publishes lifecycle [`Event`]s on a [`SignalBus`]: `Started`,
//!   any number of `Progress`/`Retrying`, then exactly one terminal event
//! - Each [`Orchestrator`] routes events of its own jobs to active hooks and
//!   everything else to its passive hook, mutating the state it owns
//! - Durable jobs are parked in an [`OfflineQueue`] while disconnected and
//!   replayed by the [`OfflineQueueManager`] on reconnect
//!
//! # Modules
//!
//! - `domain`: Data structures (Job, Event)
//! - `core`: Bus, dispatcher, pipeline, orchestrator, cache
//! - `offline`: Durable queue, storage backends, connectivity
//! - `config`: Configuration loading
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Inspect the offline queue
//! conductor queue status
//!
//! # Retry a poisoned job
//! conductor queue requeue <job-id>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod offline;

// Re-export main types at crate root for convenience
pub use core::{
    CacheProvider, CancellationToken, DispatchError, Dispatcher, Executor, JobContext, JobError, MemoryCache,
    Orchestrator, Outcome, Reactor, RetryPolicy, SignalBus,
};
pub use domain::{CachePolicy, Event, EventKind, Job, JobId, JobPayload, Progress};
pub use offline::{OfflineQueue, OfflineQueueManager};
