//! Call Cancellation
//!
//! Tokens that abort an in-flight provider request without touching any
//! other caller's request.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use super::TranscriptionError;

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cancellation token for a single request
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Race `fut` against this token
    pub async fn run<F, T>(&self, fut: F) -> Result<T, TranscriptionError>
    where
        F: Future<Output = Result<T, TranscriptionError>>,
    {
        if self.is_cancelled() {
            return Err(TranscriptionError::Cancelled);
        }
        tokio::select! {
            result = fut => result,
            _ = self.cancelled() => Err(TranscriptionError::Cancelled),
        }
    }
}

/// Registry of one provider's in-flight requests
#[derive(Debug, Default)]
pub struct InFlightCalls {
    calls: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl InFlightCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request; it is removed again when the guard drops
    pub fn register(&self) -> InFlightGuard<'_> {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        self.calls.lock().insert(id, token.clone());
        InFlightGuard {
            registry: self,
            id,
            token,
        }
    }

    /// Cancel every registered request, returning how many were signalled
    pub fn cancel_all(&self) -> usize {
        let calls = self.calls.lock();
        for token in calls.values() {
            token.cancel();
        }
        calls.len()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its request from the registry on drop
pub struct InFlightGuard<'a> {
    registry: &'a InFlightCalls,
    id: Uuid,
    token: CancellationToken,
}

impl InFlightGuard<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.calls.lock().remove(&self.id);
    }
}
