//! Cooperative cancellation.
//!
//! A token is shared between the caller that may cancel a job and the
//! business logic that polls it at safe checkpoints. Cancelling never
//! interrupts running code; it flips a flag and wakes anything waiting on
//! [`CancellationToken::cancelled`].

use std::sync::{Arc, OnceLock};

use thiserror::Error;

/// Signal raised when work observes a cancelled token
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Operation cancelled")]
pub struct Cancelled {
    pub reason: Option<String>,
}

/// Shared, cloneable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Cancel with a human-readable reason. Only the first reason is kept.
    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Checkpoint for business logic: `ctx.cancellation().throw_if_cancelled()?`
    pub fn throw_if_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled {
                reason: self.reason(),
            })
        } else {
            Ok(())
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.get().cloned()
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}
