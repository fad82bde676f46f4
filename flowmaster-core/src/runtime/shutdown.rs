//! Close signalling
//!
//! A one-shot done-signal: once `shutdown` is called every clone observes
//! it, both through the non-blocking `is_shutdown` check and by awaiting
//! `wait`.

use tokio_util::sync::CancellationToken;

/// Shutdown signal shared between the master and its background tasks
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been triggered
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token cancelled on shutdown, for deriving child contexts
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolve once shutdown has been triggered
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}
