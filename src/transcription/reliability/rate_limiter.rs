//! Rate Limiter
//!
//! Spaces out dispatches to one provider so they respect its request budget.
//! Waiters are released one at a time, oldest first; the async mutex queues
//! them in FIFO order and the holder sleeps out the rest of the interval.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Counts a caller as queued until it leaves, even if its future is dropped
struct QueuedWaiter<'a>(&'a AtomicUsize);

impl<'a> QueuedWaiter<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// FIFO dispatch spacer for one provider
pub struct RateLimiter {
    min_interval: Option<Duration>,
    last_dispatch: Mutex<Option<Instant>>,
    waiting: AtomicUsize,
}

impl RateLimiter {
    /// `requests` per `window`; zero requests disables limiting
    pub fn new(requests: u32, window: Duration) -> Self {
        let min_interval = if requests == 0 {
            None
        } else {
            Some(window / requests)
        };
        Self::with_interval(min_interval)
    }

    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute, Duration::from_secs(60))
    }

    pub fn with_interval(min_interval: Option<Duration>) -> Self {
        Self {
            min_interval,
            last_dispatch: Mutex::new(None),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    /// Callers currently queued in `acquire`
    pub fn queue_len(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait for this caller's dispatch slot
    pub async fn acquire(&self) {
        let Some(interval) = self.min_interval else {
            return;
        };

        let mut last = {
            let _queued = QueuedWaiter::enter(&self.waiting);
            self.last_dispatch.lock().await
        };

        if let Some(previous) = *last {
            let ready_at = previous + interval;
            let now = Instant::now();
            if now < ready_at {
                tracing::trace!("Rate limiter holding dispatch for {:?}", ready_at - now);
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
