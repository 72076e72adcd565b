//! Retry Policy
//!
//! Exponential backoff with jitter around a single operation. Only errors
//! flagged retryable are retried; everything else propagates at once.

use crate::transcription::{CancellationToken, TranscriptionError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    /// Upper bound of the random delay added to each backoff
    jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retrying after failed attempt `attempt` (0-based),
    /// without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.backoff(attempt) + jitter
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, TranscriptionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TranscriptionError>>,
    {
        self.execute_until(&CancellationToken::new(), op).await
    }

    /// Like `execute`, but `token` aborts the current attempt or backoff
    /// and stops any further attempt
    pub async fn execute_until<F, Fut, T>(
        &self,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T, TranscriptionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TranscriptionError>>,
    {
        let mut attempt = 0;
        loop {
            match token.run(op()).await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!("Request succeeded after {} retries", attempt);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        return Err(TranscriptionError::MaxRetriesExceeded {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }

                    let mut delay = self.delay_with_jitter(attempt - 1);
                    if let TranscriptionError::RateLimited {
                        retry_after: Some(hint),
                    } = &e
                    {
                        delay = delay.max((*hint).min(self.max_delay));
                    }
                    tracing::warn!(
                        "Attempt {}/{} failed: {}. Retrying after {:?}",
                        attempt,
                        self.max_retries,
                        e,
                        delay
                    );
                    token
                        .run(async {
                            tokio::time::sleep(delay).await;
                            Ok(())
                        })
                        .await?;
                }
            }
        }
    }
}
