//! Replays queued jobs when connectivity returns.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::cancellation::CancellationToken;
use crate::core::dispatcher::Dispatcher;
use crate::core::pipeline::Outcome;
use crate::domain::{Event, EventKind, JobId};

use super::queue::{OfflineQueue, QueueError};
use super::storage::{QueuedJob, QueuedJobStatus};

/// Result of one replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub succeeded: usize,
    pub cancelled: usize,
    /// Failed, attempts remain
    pub retrying: usize,
    pub poisoned: usize,
    /// Connectivity dropped before every entry was replayed
    pub interrupted: bool,
    /// Another replay pass was already running
    pub skipped: bool,
}

impl ReplaySummary {
    pub fn replayed(&self) -> usize {
        self.succeeded + self.cancelled + self.retrying + self.poisoned
    }
}

/// Drives the offline queue: replays pending and retrying entries on every
/// `false → true` connectivity transition
pub struct OfflineQueueManager {
    dispatcher: Arc<Dispatcher>,
    queue: Arc<OfflineQueue>,
    replay_lock: Mutex<()>,
    /// Replayed to a terminal outcome, but the entry could not be removed
    unsettled: StdMutex<HashSet<JobId>>,
}

impl OfflineQueueManager {
    /// Manage the offline queue configured on `dispatcher`
    pub fn new(dispatcher: Arc<Dispatcher>) -> Option<Self> {
        let queue = Arc::clone(dispatcher.offline_queue()?);
        Some(Self {
            dispatcher,
            queue,
            replay_lock: Mutex::new(()),
            unsettled: StdMutex::new(HashSet::new()),
        })
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Recover entries interrupted by a previous run, replay immediately if
    /// already connected, then keep replaying on every reconnect until the
    /// returned handle is stopped.
    pub async fn start(self: Arc<Self>) -> Result<ReplayHandle, QueueError> {
        self.queue.recover_interrupted().await?;

        let shutdown = CancellationToken::new();
        let mut changes = self.queue.connectivity().changes();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut connected = *changes.borrow_and_update();
                if connected {
                    connected = self.replay_logged().await;
                }

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        changed = changes.changed() => {
                            if changed.is_err() {
                                warn!("Connectivity signal closed");
                                break;
                            }
                            let now = *changes.borrow_and_update();
                            if now && !connected {
                                info!("Connectivity restored, replaying offline queue");
                                connected = self.replay_logged().await;
                            } else {
                                connected = now;
                            }
                        }
                    }
                }
                debug!("Offline queue manager stopped");
            })
        };

        Ok(ReplayHandle { shutdown, task })
    }

    /// Run a pass and log its summary. Returns false when the pass was cut
    /// short by a connectivity drop, so the next `true` triggers a new pass
    /// even if the drop and the recovery were coalesced into one change.
    async fn replay_logged(&self) -> bool {
        match self.replay_pending().await {
            Ok(summary) => {
                info!(
                    succeeded = summary.succeeded,
                    retrying = summary.retrying,
                    poisoned = summary.poisoned,
                    interrupted = summary.interrupted,
                    "Offline replay finished"
                );
                !summary.interrupted
            }
            Err(e) => {
                error!(error = %e, "Offline replay failed");
                true
            }
        }
    }

    /// Replay every pending or retrying entry, oldest first. Only one pass
    /// runs at a time; a concurrent call returns a `skipped` summary.
    pub async fn replay_pending(&self) -> Result<ReplaySummary, QueueError> {
        let Ok(_guard) = self.replay_lock.try_lock() else {
            debug!("Replay already in progress");
            return Ok(ReplaySummary {
                skipped: true,
                ..Default::default()
            });
        };

        self.settle_unsettled().await?;

        let mut summary = ReplaySummary::default();
        for entry in self.queue.replayable().await? {
            if !self.queue.is_connected() {
                summary.interrupted = true;
                break;
            }

            let queued = match self.queue.mark_processing(&entry.id).await {
                Ok(queued) => queued,
                // Removed or requeued since the listing
                Err(QueueError::NotFound(_)) | Err(QueueError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            };

            self.replay_one(&queued, &mut summary).await?;
        }

        Ok(summary)
    }

    /// Remove entries whose replay already reached a terminal outcome in an
    /// earlier pass. They are never executed again.
    async fn settle_unsettled(&self) -> Result<(), QueueError> {
        let ids: Vec<JobId> = self.unsettled_ids().iter().cloned().collect();
        for id in ids {
            self.queue.complete(&id).await?;
            self.unsettled_ids().remove(&id);
        }
        Ok(())
    }

    fn unsettled_ids(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        self.unsettled.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, queued: &QueuedJob, kind: EventKind) {
        self.dispatcher
            .bus()
            .emit(Event::for_job(&queued.id, queued.kind(), kind));
    }

    /// The outcome is emitted whether or not the queue could record it; a
    /// storage error is returned afterwards.
    async fn replay_one(&self, queued: &QueuedJob, summary: &mut ReplaySummary) -> Result<(), QueueError> {
        let error = match self.dispatcher.replay_queued(queued).await {
            Ok(Outcome::Success(data)) => {
                summary.succeeded += 1;
                return self.settle(queued, EventKind::Success { data }).await;
            }
            Ok(Outcome::Cancelled { reason }) => {
                summary.cancelled += 1;
                return self.settle(queued, EventKind::Cancelled { reason }).await;
            }
            Ok(Outcome::Failure { error, .. }) => error,
            Ok(Outcome::Timeout { duration }) => format!("Timed out after {}ms", duration.as_millis()),
            // Unknown kind, undecodable payload: counts against the attempt budget
            Err(e) => e.to_string(),
        };

        match self.queue.record_failure(&queued.id, &error).await {
            Ok(updated) => {
                self.emit_failure(queued, updated.attempt, error, summary);
                Ok(())
            }
            Err(e) => {
                warn!(job_id = %queued.id, error = %e, "Could not record replay failure");
                self.emit_failure(queued, queued.attempt.saturating_add(1), error, summary);
                if let Err(release) = self.queue.release(&queued.id).await {
                    warn!(job_id = %queued.id, error = %release, "Entry left processing until restart");
                }
                Err(e)
            }
        }
    }

    async fn settle(&self, queued: &QueuedJob, kind: EventKind) -> Result<(), QueueError> {
        let removed = self.queue.complete(&queued.id).await;
        self.emit(queued, kind);

        if let Err(e) = removed {
            warn!(job_id = %queued.id, error = %e, "Could not remove replayed entry");
            self.unsettled_ids().insert(queued.id.clone());
            return Err(e);
        }
        Ok(())
    }

    fn emit_failure(&self, queued: &QueuedJob, attempt: u32, error: String, summary: &mut ReplaySummary) {
        if self.queue.status_after_failure(attempt) == QueuedJobStatus::Poisoned {
            self.emit(
                queued,
                EventKind::Failure {
                    error,
                    was_retried: attempt > 1,
                },
            );
            summary.poisoned += 1;
        } else {
            self.emit(
                queued,
                EventKind::Retrying {
                    attempt,
                    max_retries: self.queue.max_attempts().saturating_sub(1),
                    last_error: error,
                    delay_ms: 0,
                },
            );
            summary.retrying += 1;
        }
    }
}

/// Handle to stop the replay loop
pub struct ReplayHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ReplayHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and wait for an in-flight replay pass to finish
    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        self.task.await?;
        Ok(())
    }
}
