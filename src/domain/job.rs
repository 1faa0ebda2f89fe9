//! Job records submitted for execution.
//!
//! A job is an immutable work request. The payload type decides which executor
//! handles it (through [`JobPayload::KIND`]); the surrounding [`Job`] carries the
//! cross-cutting options the pipeline enforces.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::core::cancellation::CancellationToken;
use crate::core::retry::RetryPolicy;

/// Identifier linking a job to the events it produces (its correlation id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a job id from caller-supplied text
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Domain data carried by a job.
///
/// `KIND` is the stable discriminant the dispatcher routes on. It must be
/// unique per payload type and must not change once jobs of that kind have
/// been persisted.
pub trait JobPayload: Send + Sync + 'static {
    const KIND: &'static str;
}

/// Payloads that can be parked in the offline queue and replayed later.
pub trait DurablePayload: JobPayload + Serialize + DeserializeOwned {}

impl<T> DurablePayload for T where T: JobPayload + Serialize + DeserializeOwned {}

/// How a job reads from and writes to the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Cache key for the job's result
    pub key: String,

    /// Lifetime of the written entry in milliseconds (None = cache default)
    #[serde(default)]
    pub ttl_ms: Option<u64>,

    /// Run the job even on a cache hit and refresh the entry
    #[serde(default)]
    pub revalidate: bool,
}

impl CachePolicy {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl_ms: None,
            revalidate: false,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(duration_millis(ttl));
        self
    }

    /// Serve the cached value first, then execute and refresh it
    pub fn revalidate(mut self) -> Self {
        self.revalidate = true;
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

/// An immutable work request.
#[derive(Debug, Clone)]
pub struct Job<P> {
    id: JobId,
    payload: P,
    cancellation: Option<CancellationToken>,
    retry_policy: Option<RetryPolicy>,
    timeout: Option<Duration>,
    cache: Option<CachePolicy>,
    placeholder: Option<Value>,
}

impl<P: JobPayload> Job<P> {
    /// Create a job with a generated id and no policies
    pub fn new(payload: P) -> Self {
        Self {
            id: JobId::generate(),
            payload,
            cancellation: None,
            retry_policy: None,
            timeout: None,
            cache: None,
            placeholder: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    /// Optimistic value published as a `Placeholder` event when the job is
    /// parked in the offline queue
    pub fn with_placeholder(mut self, data: Value) -> Self {
        self.placeholder = Some(data);
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn kind(&self) -> &'static str {
        P::KIND
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cache_policy(&self) -> Option<&CachePolicy> {
        self.cache.as_ref()
    }

    pub fn placeholder(&self) -> Option<&Value> {
        self.placeholder.as_ref()
    }
}

impl<P: DurablePayload> Job<P> {
    /// Convert into the persisted representation (the token is dropped)
    pub fn to_serialized(&self) -> Result<SerializedJob, serde_json::Error> {
        Ok(SerializedJob {
            id: self.id.clone(),
            kind: P::KIND.to_string(),
            payload: serde_json::to_value(&self.payload)?,
            retry_policy: self.retry_policy.clone(),
            timeout_ms: self.timeout.map(duration_millis),
            cache: self.cache.clone(),
            placeholder: self.placeholder.clone(),
        })
    }
}

impl<P: JobPayload + Serialize> Job<P> {
    /// Deterministic cache key derived from the payload content.
    ///
    /// Format: `{kind}:{hash16}`
    pub fn payload_cache_key(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(&self.payload)?;
        Ok(format!("{}:{}", P::KIND, hash_input(&json)))
    }
}

/// Persisted form of a durable job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedJob {
    pub id: JobId,

    /// Job kind discriminant (`JobPayload::KIND`)
    pub kind: String,

    /// Payload field map
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CachePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<Value>,
}

impl SerializedJob {
    /// Rebuild a typed job from its persisted form
    pub fn decode<P: DurablePayload>(&self) -> Result<Job<P>, serde_json::Error> {
        let payload: P = serde_json::from_value(self.payload.clone())?;

        Ok(Job {
            id: self.id.clone(),
            payload,
            cancellation: None,
            retry_policy: self.retry_policy.clone(),
            timeout: self.timeout_ms.map(Duration::from_millis),
            cache: self.cache.clone(),
            placeholder: self.placeholder.clone(),
        })
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Hash input content (first 16 hex chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
