//! Domain types for the conductor engine.
//!
//! This module contains the core data structures:
//! - Job: Immutable work requests and their persisted form
//! - Events: Immutable lifecycle and domain signals

pub mod events;
pub mod job;

// Re-export commonly used types
pub use events::{Event, EventKind, Progress};
pub use job::{hash_input, CachePolicy, DurablePayload, Job, JobId, JobPayload, SerializedJob};
