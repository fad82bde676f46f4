//! First-error-wins fault holder
//!
//! Any subsystem may report an error; the first one is kept and cancels
//! every context derived through `with_cancel_on_first_error`. Later reports
//! are ignored until `reset`.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MasterError;

#[derive(Default)]
struct Inner {
    err: Option<MasterError>,
    children: HashMap<u64, CancellationToken>,
    next_id: u64,
}

/// Holds at most one error and the contexts it must cancel
#[derive(Clone, Default)]
pub struct ErrCenter {
    inner: Arc<Mutex<Inner>>,
}

impl ErrCenter {
    /// Create an empty error center
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` unless an error is already held
    pub fn on_error(&self, err: MasterError) {
        let children = {
            let mut inner = self.inner.lock();
            if inner.err.is_some() {
                debug!(error = %err, "Error center already faulted, ignoring");
                return;
            }
            warn!(error = %err, "Error center recorded first error");
            inner.err = Some(err);
            inner.children.drain().map(|(_, token)| token).collect::<Vec<_>>()
        };

        for token in children {
            token.cancel();
        }
    }

    /// The held error, if any
    pub fn check_error(&self) -> Option<MasterError> {
        self.inner.lock().err.clone()
    }

    /// Clear the held error
    pub fn reset(&self) {
        self.inner.lock().err = None;
    }

    /// Derive a context cancelled by `parent` or by the first recorded error
    pub fn with_cancel_on_first_error(&self, parent: &CancellationToken) -> ErrCtx {
        let token = parent.child_token();
        let mut inner = self.inner.lock();
        if inner.err.is_some() {
            token.cancel();
            return ErrCtx {
                token,
                id: None,
                center: Weak::new(),
            };
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.children.insert(id, token.clone());
        ErrCtx {
            token,
            id: Some(id),
            center: Arc::downgrade(&self.inner),
        }
    }

    #[cfg(test)]
    fn live_children(&self) -> usize {
        self.inner.lock().children.len()
    }
}

/// Context handed out by the error center
///
/// Dereferences to its cancellation token and stops being tracked when
/// dropped.
pub struct ErrCtx {
    token: CancellationToken,
    id: Option<u64>,
    center: Weak<Mutex<Inner>>,
}

impl ErrCtx {
    /// The underlying token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Deref for ErrCtx {
    type Target = CancellationToken;

    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl Drop for ErrCtx {
    fn drop(&mut self) {
        if let (Some(id), Some(inner)) = (self.id, self.center.upgrade()) {
            inner.lock().children.remove(&id);
        }
    }
}
