//! Lifecycle rules for durably queued jobs.
//!
//! ```text
//! pending ──► processing ──► (success) removed
//!    ▲            │
//!    │            ├──► retrying ──► processing ...
//!    │            │
//!    └─ requeue ──┴──► poisoned   (attempts exhausted, manual only)
//! ```

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{JobId, SerializedJob};

use super::connectivity::ConnectivityProvider;
use super::storage::{QueueStorage, QueueStorageError, QueuedJob, QueuedJobStatus, QueuedJobUpdate};

/// Default number of failed attempts before a job is poisoned
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Errors raised by queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queued job not found: {0}")]
    NotFound(JobId),

    #[error("Invalid state transition for {id}: {from} → {to}")]
    InvalidTransition {
        id: JobId,
        from: QueuedJobStatus,
        to: QueuedJobStatus,
    },

    #[error(transparent)]
    Storage(#[from] QueueStorageError),
}

/// Count of queued jobs per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSummary {
    pub pending: usize,
    pub processing: usize,
    pub retrying: usize,
    pub poisoned: usize,
}

impl QueueSummary {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.retrying + self.poisoned
    }
}

/// Durable job queue bound to a storage backend and a connectivity signal
pub struct OfflineQueue {
    storage: Arc<dyn QueueStorage>,
    connectivity: Arc<dyn ConnectivityProvider>,
    max_attempts: u32,
}

impl OfflineQueue {
    pub fn new(storage: Arc<dyn QueueStorage>, connectivity: Arc<dyn ConnectivityProvider>) -> Self {
        Self {
            storage,
            connectivity,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Failed attempts allowed before poisoning (at least 1)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn storage(&self) -> &Arc<dyn QueueStorage> {
        &self.storage
    }

    pub fn connectivity(&self) -> &Arc<dyn ConnectivityProvider> {
        &self.connectivity
    }

    pub fn is_connected(&self) -> bool {
        self.connectivity.is_connected()
    }

    /// Persist a job as `pending`
    pub async fn enqueue(&self, job: SerializedJob) -> Result<QueuedJob, QueueError> {
        let queued = QueuedJob::pending(job);
        self.storage.save_job(&queued).await?;
        info!(job_id = %queued.id, kind = %queued.kind(), "Job queued for replay");
        Ok(queued)
    }

    /// Persist a job whose first live attempt already failed
    pub async fn park_failure(&self, job: SerializedJob, error: &str) -> Result<QueuedJob, QueueError> {
        let mut queued = QueuedJob::pending(job);
        queued.attempt = 1;
        queued.status = self.status_after_failure(queued.attempt);
        queued.last_error = Some(error.to_string());

        self.storage.save_job(&queued).await?;
        warn!(
            job_id = %queued.id,
            status = %queued.status,
            error,
            "Failed job parked in offline queue"
        );
        Ok(queued)
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.storage.get_job(id).await?)
    }

    /// All entries in enqueue order
    pub async fn list(&self) -> Result<Vec<QueuedJob>, QueueError> {
        Ok(self.storage.get_all_jobs().await?)
    }

    /// Entries automatic replay will pick up, oldest first
    pub async fn replayable(&self) -> Result<Vec<QueuedJob>, QueueError> {
        let mut jobs: Vec<QueuedJob> = self
            .storage
            .get_all_jobs()
            .await?
            .into_iter()
            .filter(|j| j.status.is_replayable())
            .collect();
        jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(jobs)
    }

    /// pending | retrying → processing
    pub async fn mark_processing(&self, id: &JobId) -> Result<QueuedJob, QueueError> {
        let job = self.require(id).await?;
        if !job.status.is_replayable() {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                from: job.status,
                to: QueuedJobStatus::Processing,
            });
        }

        let update = QueuedJobUpdate::status(QueuedJobStatus::Processing);
        Ok(self.storage.update_job(id, update).await?)
    }

    /// Successful (or cancelled) replay: the entry is deleted
    pub async fn complete(&self, id: &JobId) -> Result<bool, QueueError> {
        let removed = self.storage.remove_job(id).await?;
        debug!(job_id = %id, "Queued job completed");
        Ok(removed)
    }

    /// processing → retrying without spending an attempt. Used when a replay
    /// ran but its outcome could not be recorded.
    pub async fn release(&self, id: &JobId) -> Result<QueuedJob, QueueError> {
        let update = QueuedJobUpdate::status(QueuedJobStatus::Retrying);
        let updated = self.storage.update_job(id, update).await?;
        debug!(job_id = %id, "Queued job released for another replay");
        Ok(updated)
    }

    /// processing → retrying, or → poisoned once attempts are exhausted
    pub async fn record_failure(&self, id: &JobId, error: &str) -> Result<QueuedJob, QueueError> {
        let job = self.require(id).await?;
        if job.status != QueuedJobStatus::Processing {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                from: job.status,
                to: QueuedJobStatus::Retrying,
            });
        }

        let attempt = job.attempt.saturating_add(1);
        let status = self.status_after_failure(attempt);
        let update = QueuedJobUpdate::status(status)
            .with_attempt(attempt)
            .with_error(Some(error.to_string()));
        let updated = self.storage.update_job(id, update).await?;

        if status == QueuedJobStatus::Poisoned {
            warn!(job_id = %id, attempt, error, "Queued job poisoned");
        } else {
            debug!(job_id = %id, attempt, error, "Queued job will be retried");
        }
        Ok(updated)
    }

    /// Manual intervention: poisoned → pending with a fresh attempt budget
    pub async fn requeue(&self, id: &JobId) -> Result<QueuedJob, QueueError> {
        let job = self.require(id).await?;
        if job.status != QueuedJobStatus::Poisoned {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                from: job.status,
                to: QueuedJobStatus::Pending,
            });
        }

        let update = QueuedJobUpdate::status(QueuedJobStatus::Pending)
            .with_attempt(0)
            .with_error(None);
        let updated = self.storage.update_job(id, update).await?;
        info!(job_id = %id, "Poisoned job requeued");
        Ok(updated)
    }

    pub async fn remove(&self, id: &JobId) -> Result<bool, QueueError> {
        Ok(self.storage.remove_job(id).await?)
    }

    pub async fn clear(&self) -> Result<usize, QueueError> {
        Ok(self.storage.clear_all().await?)
    }

    /// Move entries left `processing` by an interrupted run back to
    /// `retrying`. Returns the number of recovered entries.
    pub async fn recover_interrupted(&self) -> Result<usize, QueueError> {
        let mut recovered = 0;
        for job in self.storage.get_all_jobs().await? {
            if job.status == QueuedJobStatus::Processing {
                self.storage
                    .update_job(&job.id, QueuedJobUpdate::status(QueuedJobStatus::Retrying))
                    .await?;
                recovered += 1;
            }
        }

        if recovered > 0 {
            warn!(recovered, "Recovered interrupted queue entries");
        }
        Ok(recovered)
    }

    pub async fn summary(&self) -> Result<QueueSummary, QueueError> {
        let mut summary = QueueSummary::default();
        for job in self.storage.get_all_jobs().await? {
            match job.status {
                QueuedJobStatus::Pending => summary.pending += 1,
                QueuedJobStatus::Processing => summary.processing += 1,
                QueuedJobStatus::Retrying => summary.retrying += 1,
                QueuedJobStatus::Poisoned => summary.poisoned += 1,
            }
        }
        Ok(summary)
    }

    pub(crate) fn status_after_failure(&self, attempt: u32) -> QueuedJobStatus {
        if attempt >= self.max_attempts {
            QueuedJobStatus::Poisoned
        } else {
            QueuedJobStatus::Retrying
        }
    }

    async fn require(&self, id: &JobId) -> Result<QueuedJob, QueueError> {
        self.storage
            .get_job(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }
}
