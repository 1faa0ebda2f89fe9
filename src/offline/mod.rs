//! Durable offline queue.
//!
//! Jobs that must survive disconnection or a restart are persisted here and
//! replayed through the normal pipeline once connectivity returns.

pub mod connectivity;
pub mod jsonl;
pub mod manager;
pub mod queue;
pub mod storage;

pub use connectivity::{AlwaysConnected, ConnectivityProvider, ManualConnectivity};
pub use jsonl::JsonlQueueStorage;
pub use manager::{OfflineQueueManager, ReplayHandle, ReplaySummary};
pub use queue::{OfflineQueue, QueueError, QueueSummary, DEFAULT_MAX_ATTEMPTS};
pub use storage::{MemoryQueueStorage, QueueStorage, QueueStorageError, QueuedJob, QueuedJobStatus, QueuedJobUpdate};
