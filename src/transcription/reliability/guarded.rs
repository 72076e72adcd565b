//! Guarded Provider
//!
//! Wraps a provider so every call goes concurrency cap -> rate limiter ->
//! circuit breaker -> retry policy -> network. Retries run inside one breaker
//! pass, so a retried call counts once toward the breaker's failure/success
//! accounting. Each call holds a cancellation token for its whole lifetime,
//! so `cancel` also reaches calls that are queued or backing off.

use super::{CircuitBreaker, RateLimiter, RetryPolicy};
use crate::config::ProviderConfig;
use crate::transcription::{
    InFlightCalls, ProviderCapabilities, ProviderId, TranscriptionError, TranscriptionOptions,
    TranscriptionProvider, TranscriptionResponse,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Provider with the reliability pipeline applied to `transcribe`
pub struct ReliableProvider {
    inner: Arc<dyn TranscriptionProvider>,
    limiter: RateLimiter,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    /// `None` when concurrency is uncapped
    concurrency: Option<Semaphore>,
    max_concurrency: u32,
    calls: InFlightCalls,
}

impl ReliableProvider {
    pub fn new(
        inner: Arc<dyn TranscriptionProvider>,
        limiter: RateLimiter,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner,
            limiter,
            breaker,
            retry,
            concurrency: None,
            max_concurrency: 0,
            calls: InFlightCalls::new(),
        }
    }

    /// Cap simultaneous calls; zero leaves them uncapped
    pub fn with_max_concurrency(mut self, max: u32) -> Self {
        self.max_concurrency = max;
        self.concurrency = (max > 0).then(|| Semaphore::new(max as usize));
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn max_concurrency(&self) -> Option<u32> {
        (self.max_concurrency > 0).then_some(self.max_concurrency)
    }

    /// Calls currently inside `transcribe`, queued ones included
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }
}

impl fmt::Debug for ReliableProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableProvider")
            .field("provider", &self.inner.id())
            .field("circuit", &self.breaker.state())
            .field("max_concurrency", &self.max_concurrency())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[async_trait]
impl TranscriptionProvider for ReliableProvider {
    async fn transcribe(
        &self,
        audio: &[u8],
        options: &TranscriptionOptions,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        let call = self.calls.register();
        let token = call.token();

        let _permit = match &self.concurrency {
            Some(semaphore) => Some(
                token
                    .run(async {
                        semaphore.acquire().await.map_err(|_| {
                            TranscriptionError::ProviderUnavailable(format!(
                                "{} is shutting down",
                                self.inner.id()
                            ))
                        })
                    })
                    .await?,
            ),
            None => None,
        };

        token
            .run(async {
                self.limiter.acquire().await;
                Ok(())
            })
            .await?;

        let inner = &self.inner;
        let retry = &self.retry;
        self.breaker
            .execute(|| retry.execute_until(token, || inner.transcribe(audio, options)))
            .await
    }

    async fn validate_api_key(&self, api_key: &str) -> bool {
        self.inner.validate_api_key(api_key).await
    }

    fn cancel(&self) {
        let cancelled = self.calls.cancel_all();
        if cancelled > 0 {
            tracing::info!("Cancelling {} call(s) to {}", cancelled, self.inner.id());
        }
        self.inner.cancel();
    }

    fn id(&self) -> ProviderId {
        self.inner.id()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.inner.capabilities()
    }

    fn config(&self) -> &ProviderConfig {
        self.inner.config()
    }

    fn is_available(&self) -> bool {
        self.inner.is_available() && !self.breaker.is_open()
    }

    fn cost_per_minute(&self) -> Option<f64> {
        self.inner.cost_per_minute()
    }
}
