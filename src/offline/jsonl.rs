//! JSONL-backed queue storage.
//!
//! Append-only log with state derived from replay. Every mutation appends one
//! record; reading replays the whole log. All access goes through an `fs2`
//! file lock (shared for reads, exclusive for writes), so the running
//! application and the `conductor queue` CLI can share one file.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::JobId;

use super::storage::{QueueStorage, QueueStorageError, QueuedJob, QueuedJobUpdate};

/// One line of the queue log
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    ts: DateTime<Utc>,

    #[serde(flatten)]
    op: LogOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogOp {
    Saved { job: QueuedJob },
    Updated { id: JobId, update: QueuedJobUpdate },
    Removed { id: JobId },
    Cleared,
}

impl LogOp {
    fn record(self) -> LogRecord {
        LogRecord { ts: Utc::now(), op: self }
    }
}

/// Queue state rebuilt from the log, in enqueue order
#[derive(Debug, Default)]
struct QueueState {
    jobs: Vec<QueuedJob>,
}

impl QueueState {
    fn position(&self, id: &JobId) -> Option<usize> {
        self.jobs.iter().position(|j| &j.id == id)
    }

    fn apply(&mut self, op: LogOp) {
        match op {
            LogOp::Saved { job } => match self.position(&job.id) {
                Some(index) => self.jobs[index] = job,
                None => self.jobs.push(job),
            },
            LogOp::Updated { id, update } => {
                if let Some(index) = self.position(&id) {
                    self.jobs[index].apply(&update);
                }
            }
            LogOp::Removed { id } => {
                if let Some(index) = self.position(&id) {
                    self.jobs.remove(index);
                }
            }
            LogOp::Cleared => self.jobs.clear(),
        }
    }
}

/// File-backed [`QueueStorage`]
#[derive(Debug, Clone)]
pub struct JsonlQueueStorage {
    path: PathBuf,
}

impl JsonlQueueStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create the parent directory if needed and return the storage
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, QueueStorageError> {
        let storage = Self::new(path);
        if let Some(parent) = storage.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the log so it holds one `saved` record per live entry.
    /// Returns the number of records dropped.
    pub async fn compact(&self) -> Result<usize, QueueStorageError> {
        self.with_file(true, |file, path| {
            let (state, records) = replay(file)?;

            let tmp = sibling(path, "tmp");
            {
                let mut out = File::create(&tmp)?;
                for job in &state.jobs {
                    write_record(&mut out, &LogOp::Saved { job: job.clone() }.record())?;
                }
                out.sync_all()?;
            }
            fs::rename(&tmp, path)?;

            let dropped = records.saturating_sub(state.jobs.len());
            debug!(path = %path.display(), dropped, "Compacted queue log");
            Ok(dropped)
        })
        .await
    }

    async fn load(&self) -> Result<QueueState, QueueStorageError> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(QueueState::default());
        }
        self.with_file(false, |file, _| Ok(replay(file)?.0)).await
    }

    async fn append(&self, op: LogOp) -> Result<(), QueueStorageError> {
        self.with_file(true, move |file, _| write_record(file, &op.record()))
            .await
    }

    /// Run `f` on a blocking thread with the log open and locked.
    ///
    /// The lock is taken on a `<log>.lock` sidecar rather than the log itself,
    /// so a writer waiting on the lock never holds a handle to a log that
    /// `compact` is about to replace.
    async fn with_file<T, F>(&self, exclusive: bool, f: F) -> Result<T, QueueStorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut File, &Path) -> Result<T, QueueStorageError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let lock = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(sibling(&path, "lock"))?;

            if exclusive {
                lock.lock_exclusive()?;
            } else {
                lock.lock_shared()?;
            }

            let result = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)
                .map_err(QueueStorageError::from)
                .and_then(|mut file| {
                    if exclusive {
                        truncate_torn_tail(&mut file, &path)?;
                    }
                    f(&mut file, &path)
                });

            // Also released when the file is dropped
            let _ = lock.unlock();
            result
        })
        .await
        .map_err(|e| QueueStorageError::Io(std::io::Error::other(e)))?
    }
}

/// `queue.jsonl` -> `queue.jsonl.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Cut a partial final record left by a crash mid-append, so the next append
/// starts on its own line. Leaves the read position at the start of the file.
fn truncate_torn_tail(file: &mut File, path: &Path) -> Result<(), QueueStorageError> {
    let len = file.metadata()?.len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;

        if last[0] != b'\n' {
            let mut content = Vec::new();
            file.seek(SeekFrom::Start(0))?;
            file.read_to_end(&mut content)?;
            let keep = content
                .iter()
                .rposition(|b| *b == b'\n')
                .map_or(0, |index| index as u64 + 1);
            file.set_len(keep)?;
            warn!(path = %path.display(), dropped = len - keep, "Truncated torn record at end of queue log");
        }
    }
    file.seek(SeekFrom::Start(0))?;
    Ok(())
}

fn write_record(file: &mut File, record: &LogRecord) -> Result<(), QueueStorageError> {
    let json = serde_json::to_string(record)?;
    writeln!(file, "{}", json)?;
    file.flush()?;
    Ok(())
}

/// Replay the log. Returns the state and the number of records read.
///
/// A torn final line (crash mid-append) is skipped; any other unreadable line
/// is an error.
fn replay(file: &mut File) -> Result<(QueueState, usize), QueueStorageError> {
    let mut content = String::new();
    file.read_to_string(&mut content)?;

    let mut state = QueueState::default();
    let mut records = 0;
    let complete = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();

    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => {
                state.apply(record.op);
                records += 1;
            }
            Err(e) if !complete && index + 1 == lines.len() => {
                warn!(line = index + 1, error = %e, "Skipping torn record at end of queue log");
            }
            Err(source) => {
                return Err(QueueStorageError::Corrupt {
                    line: index + 1,
                    source,
                })
            }
        }
    }

    Ok((state, records))
}

#[async_trait]
impl QueueStorage for JsonlQueueStorage {
    async fn save_job(&self, job: &QueuedJob) -> Result<(), QueueStorageError> {
        self.append(LogOp::Saved { job: job.clone() }).await
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<QueuedJob>, QueueStorageError> {
        let state = self.load().await?;
        Ok(state.jobs.into_iter().find(|j| &j.id == id))
    }

    async fn get_all_jobs(&self) -> Result<Vec<QueuedJob>, QueueStorageError> {
        Ok(self.load().await?.jobs)
    }

    async fn update_job(&self, id: &JobId, update: QueuedJobUpdate) -> Result<QueuedJob, QueueStorageError> {
        let id = id.clone();
        // Read and append under one exclusive lock
        self.with_file(true, move |file, _| {
            let (state, _) = replay(file)?;
            let mut job = state
                .jobs
                .into_iter()
                .find(|j| j.id == id)
                .ok_or_else(|| QueueStorageError::NotFound(id.clone()))?;

            job.apply(&update);
            write_record(file, &LogOp::Updated { id, update }.record())?;
            Ok(job)
        })
        .await
    }

    async fn remove_job(&self, id: &JobId) -> Result<bool, QueueStorageError> {
        let id = id.clone();
        self.with_file(true, move |file, _| {
            let (state, _) = replay(file)?;
            if state.position(&id).is_none() {
                return Ok(false);
            }
            write_record(file, &LogOp::Removed { id }.record())?;
            Ok(true)
        })
        .await
    }

    async fn clear_all(&self) -> Result<usize, QueueStorageError> {
        self.with_file(true, |file, _| {
            let (state, _) = replay(file)?;
            write_record(file, &LogOp::Cleared.record())?;
            Ok(state.jobs.len())
        })
        .await
    }
}
