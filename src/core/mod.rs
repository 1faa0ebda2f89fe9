//! Core execution engine.
//!
//! This module contains:
//! - SignalBus: In-process broadcast of events
//! - Dispatcher: Kind-keyed executor registry
//! - Pipeline: Cancellation, timeout, retry and the error boundary
//! - Orchestrator: Active/passive event routing over owned state
//! - Cache: TTL/LRU result cache and its invalidation job

pub mod bus;
pub mod cache;
pub mod cancellation;
pub mod dispatcher;
pub mod invalidation;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;

// Re-export commonly used types
pub use bus::{BusError, SignalBus, Subscription, SubscriptionId};
pub use cache::{spawn_expiry_sweeper, CacheProvider, CacheStats, MemoryCache};
pub use cancellation::{CancellationToken, Cancelled};
pub use dispatcher::{DispatchError, Dispatcher};
pub use invalidation::{CacheInvalidationExecutor, InvalidateCache};
pub use orchestrator::{Orchestrator, OrchestratorError, Reactor};
pub use pipeline::{Executor, JobContext, JobError, Outcome};
pub use retry::RetryPolicy;
