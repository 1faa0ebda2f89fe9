//! Event types broadcast on the signal bus.
//!
//! Every lifecycle event carries the id of the job that produced it. Domain
//! events are free-standing facts and usually carry no correlation id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::job::JobId;

/// A single immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event was created
    pub timestamp: DateTime<Utc>,

    /// Originating job id (None for free-standing domain events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<JobId>,

    /// Kind of the originating job, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_kind: Option<String>,

    /// What happened
    pub kind: EventKind,
}

impl Event {
    /// Create a lifecycle event for a job
    pub fn for_job(job_id: &JobId, job_kind: &str, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: Some(job_id.clone()),
            job_kind: Some(job_kind.to_string()),
            kind,
        }
    }

    /// Create a free-standing domain event
    pub fn domain(name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            job_kind: None,
            kind: EventKind::Domain {
                name: name.into(),
                payload,
            },
        }
    }

    /// Attach a correlation id to a domain event
    pub fn with_correlation(mut self, job_id: JobId) -> Self {
        self.correlation_id = Some(job_id);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// True when this event belongs to the given job
    pub fn correlates_with(&self, job_id: &JobId) -> bool {
        self.correlation_id.as_ref() == Some(job_id)
    }
}

/// Closed set of event kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventKind {
    /// The job was accepted for execution
    Started,

    /// Business logic reported progress
    Progress(Progress),

    /// An attempt failed and another one is scheduled
    Retrying {
        /// 1-based number of the retry about to run
        attempt: u32,
        max_retries: u32,
        last_error: String,
        delay_ms: u64,
    },

    Success {
        data: Value,
    },

    Failure {
        error: String,
        was_retried: bool,
    },

    Cancelled {
        #[serde(default)]
        reason: Option<String>,
    },

    Timeout {
        duration_ms: u64,
    },

    /// A cached value was found for the job's cache key
    CacheHit {
        data: Value,
    },

    /// Optimistic value for a job parked in the offline queue
    Placeholder {
        data: Value,
    },

    /// Application-defined fact
    Domain {
        name: String,
        #[serde(default)]
        payload: Value,
    },
}

impl EventKind {
    /// Success, Failure, Cancelled and Timeout end a job's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success { .. } | Self::Failure { .. } | Self::Cancelled { .. } | Self::Timeout { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress(_) => "progress",
            Self::Retrying { .. } => "retrying",
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::Cancelled { .. } => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::CacheHit { .. } => "cache_hit",
            Self::Placeholder { .. } => "placeholder",
            Self::Domain { .. } => "domain",
        }
    }
}

/// Progress report from business logic.
///
/// Values are clamped to `[0, 1]`; successive reports are not required to be
/// monotonic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub value: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
}

impl Progress {
    pub fn new(value: f64) -> Self {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        Self {
            value,
            message: None,
            step: None,
            total: None,
        }
    }

    /// Progress expressed as `step` of `total`
    pub fn from_steps(step: u32, total: u32) -> Self {
        let value = if total == 0 {
            0.0
        } else {
            step as f64 / total as f64
        };
        let mut progress = Self::new(value);
        progress.step = Some(step);
        progress.total = Some(total);
        progress
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
