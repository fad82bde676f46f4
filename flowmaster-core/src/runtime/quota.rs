//! Concurrency quota for worker creation
//!
//! A fixed pool of tokens bounding how many creation sequences may be in
//! flight. Tokens are acquired with `consume` and handed back with `release`;
//! every successful `consume` must be paired with exactly one `release`.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{MasterError, Result};

/// Bounded counting semaphore with cancellable acquire
#[derive(Clone)]
pub struct ConcurrencyQuota {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyQuota {
    /// Create a quota holding `capacity` tokens
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Wait for a token until `wait` elapses or `ctx` is cancelled.
    ///
    /// No token is consumed when an error is returned.
    pub async fn consume(&self, ctx: &CancellationToken, wait: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(MasterError::Cancelled {
                reason: "quota wait cancelled".into(),
            }),
            acquired = tokio::time::timeout(wait, self.semaphore.acquire()) => match acquired {
                Ok(Ok(permit)) => {
                    permit.forget();
                    Ok(())
                }
                Ok(Err(_)) => Err(MasterError::Internal {
                    message: "quota semaphore closed".into(),
                }),
                Err(_) => Err(MasterError::ConcurrencyExceeded {
                    reason: format!("no quota available within {}ms", wait.as_millis()),
                }),
            },
        }
    }

    /// Try to take a token without waiting
    pub fn try_consume(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Return a token to the pool
    pub fn release(&self) {
        self.semaphore.add_permits(1);
    }

    /// Tokens currently available
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Releases one token when dropped
pub struct QuotaGuard {
    quota: ConcurrencyQuota,
}

impl QuotaGuard {
    /// Take ownership of a token that was already consumed
    pub fn new(quota: ConcurrencyQuota) -> Self {
        Self { quota }
    }
}

impl Drop for QuotaGuard {
    fn drop(&mut self) {
        self.quota.release();
    }
}
