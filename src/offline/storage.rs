//! Durable storage contract for queued jobs.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::domain::{JobId, SerializedJob};

/// Errors raised by [`QueueStorage`] implementations
#[derive(Debug, Error)]
pub enum QueueStorageError {
    #[error("Queued job not found: {0}")]
    NotFound(JobId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt queue log at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Lifecycle state of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedJobStatus {
    /// Waiting for its first replay
    Pending,
    /// Currently being replayed
    Processing,
    /// Failed at least once, attempts remain
    Retrying,
    /// Attempts exhausted; needs manual intervention
    Poisoned,
}

impl QueuedJobStatus {
    /// Whether automatic replay picks this entry up
    pub fn is_replayable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Poisoned => "poisoned",
        }
    }
}

impl std::fmt::Display for QueuedJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueuedJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "retrying" => Ok(Self::Retrying),
            "poisoned" => Ok(Self::Poisoned),
            other => Err(format!("Unknown queue status: {}", other)),
        }
    }
}

/// A persisted job awaiting replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,

    pub job: SerializedJob,

    pub status: QueuedJobStatus,

    /// Number of failed processing attempts so far
    pub attempt: u32,

    pub enqueued_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedJob {
    /// New `pending` record for a serialized job
    pub fn pending(job: SerializedJob) -> Self {
        let now = Utc::now();
        Self {
            id: job.id.clone(),
            job,
            status: QueuedJobStatus::Pending,
            attempt: 0,
            enqueued_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn kind(&self) -> &str {
        &self.job.kind
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, update: &QueuedJobUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(attempt) = update.attempt {
            self.attempt = attempt;
        }
        if let Some(last_error) = &update.last_error {
            self.last_error = last_error.clone();
        }
        self.updated_at = update.updated_at;
    }
}

/// Partial update of a [`QueuedJob`]. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJobUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<QueuedJobStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// `Some(None)` clears the stored error
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_option"
    )]
    pub last_error: Option<Option<String>>,

    pub updated_at: DateTime<Utc>,
}

/// Keep an explicit `null` distinct from a missing field
fn present_option<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl Default for QueuedJobUpdate {
    fn default() -> Self {
        Self {
            status: None,
            attempt: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

impl QueuedJobUpdate {
    pub fn status(status: QueuedJobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }
}

/// Durable key/value persistence for queued jobs.
///
/// `get_all_jobs` returns entries in enqueue order. `save_job` overwrites an
/// existing entry with the same id.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    async fn save_job(&self, job: &QueuedJob) -> Result<(), QueueStorageError>;

    async fn get_job(&self, id: &JobId) -> Result<Option<QueuedJob>, QueueStorageError>;

    async fn get_all_jobs(&self) -> Result<Vec<QueuedJob>, QueueStorageError>;

    /// Apply a partial update and return the updated record
    async fn update_job(&self, id: &JobId, update: QueuedJobUpdate) -> Result<QueuedJob, QueueStorageError>;

    /// Returns false if no entry existed
    async fn remove_job(&self, id: &JobId) -> Result<bool, QueueStorageError>;

    /// Returns the number of removed entries
    async fn clear_all(&self) -> Result<usize, QueueStorageError>;
}

/// Non-durable storage for tests and ephemeral queues
#[derive(Debug, Default)]
pub struct MemoryQueueStorage {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, Vec<QueuedJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QueueStorage for MemoryQueueStorage {
    async fn save_job(&self, job: &QueuedJob) -> Result<(), QueueStorageError> {
        let mut jobs = self.jobs();
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<QueuedJob>, QueueStorageError> {
        Ok(self.jobs().iter().find(|j| &j.id == id).cloned())
    }

    async fn get_all_jobs(&self) -> Result<Vec<QueuedJob>, QueueStorageError> {
        Ok(self.jobs().clone())
    }

    async fn update_job(&self, id: &JobId, update: QueuedJobUpdate) -> Result<QueuedJob, QueueStorageError> {
        let mut jobs = self.jobs();
        let job = jobs
            .iter_mut()
            .find(|j| &j.id == id)
            .ok_or_else(|| QueueStorageError::NotFound(id.clone()))?;
        job.apply(&update);
        Ok(job.clone())
    }

    async fn remove_job(&self, id: &JobId) -> Result<bool, QueueStorageError> {
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|j| &j.id != id);
        Ok(jobs.len() != before)
    }

    async fn clear_all(&self) -> Result<usize, QueueStorageError> {
        let mut jobs = self.jobs();
        let count = jobs.len();
        jobs.clear();
        Ok(count)
    }
}
