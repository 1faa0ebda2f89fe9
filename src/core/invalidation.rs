//! Built-in system job that removes cache entries.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::{Job, JobPayload};

use super::cache::CacheProvider;
use super::pipeline::{Executor, JobContext, JobError};

/// What to remove from the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum InvalidateCache {
    Key { key: String },
    Keys { keys: Vec<String> },
    /// Glob pattern, e.g. `user:*`
    Pattern { pattern: String },
    All,
}

impl JobPayload for InvalidateCache {
    const KIND: &'static str = "cache.invalidate";
}

/// Executor for [`InvalidateCache`]. Succeeds with `{"removed": n}`.
///
/// `All` reports the number of entries present before clearing.
pub struct CacheInvalidationExecutor {
    cache: Arc<dyn CacheProvider>,
}

impl CacheInvalidationExecutor {
    pub fn new(cache: Arc<dyn CacheProvider>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Executor<InvalidateCache> for CacheInvalidationExecutor {
    async fn process(&self, job: &Job<InvalidateCache>, ctx: &JobContext) -> Result<Value, JobError> {
        ctx.throw_if_cancelled()?;

        let removed = match job.payload() {
            InvalidateCache::Key { key } => usize::from(self.cache.delete(key)),
            InvalidateCache::Keys { keys } => keys.iter().filter(|key| self.cache.delete(key)).count(),
            InvalidateCache::Pattern { pattern } => self
                .cache
                .delete_pattern(pattern)
                .map_err(|e| JobError::failed(format!("Invalid cache pattern '{}': {}", pattern, e)))?,
            InvalidateCache::All => {
                let count = self.cache.len();
                self.cache.clear();
                count
            }
        };

        Ok(json!({ "removed": removed }))
    }
}
