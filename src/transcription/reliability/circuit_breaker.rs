//! Circuit Breaker
//!
//! Three-state health guard around one provider. While open, calls fail
//! immediately with `ProviderUnavailable` and never reach the network.

use crate::transcription::{ProviderId, TranscriptionError};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Half-open successes that close it again
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt: None,
            probe_in_flight: false,
        }
    }
}

/// Frees the half-open probe slot even if the call future is dropped
struct ProbeRelease<'a>(&'a Mutex<BreakerInner>);

impl Drop for ProbeRelease<'_> {
    fn drop(&mut self) {
        self.0.lock().probe_in_flight = false;
    }
}

/// Whether an admitted call holds the half-open probe slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Per-provider circuit breaker
pub struct CircuitBreaker {
    provider: ProviderId,
    config: Mutex<CircuitBreakerConfig>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: ProviderId, config: CircuitBreakerConfig) -> Self {
        Self {
            provider,
            config: Mutex::new(config),
            inner: Mutex::new(BreakerInner::closed()),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config.lock().clone()
    }

    /// Swap thresholds in place; current state and counters are kept and
    /// judged against the new thresholds from the next outcome on
    pub fn set_config(&self, config: CircuitBreakerConfig) {
        *self.config.lock() = config;
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.inner.lock().success_count
    }

    /// Open and still inside the cooldown
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == CircuitState::Open
            && inner.next_attempt.map(|t| Instant::now() < t).unwrap_or(true)
    }

    /// Run `op` through the breaker
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, TranscriptionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TranscriptionError>>,
    {
        let admission = self.before_call()?;
        let _probe = (admission == Admission::Probe).then(|| ProbeRelease(&self.inner));

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            // Caller aborted; says nothing about provider health
            Err(TranscriptionError::Cancelled) => Err(TranscriptionError::Cancelled),
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Admit or short-circuit a call, moving OPEN to HALF_OPEN once the
    /// cooldown has elapsed
    fn before_call(&self) -> Result<Admission, TranscriptionError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let ready = inner.next_attempt.map(|t| Instant::now() >= t).unwrap_or(false);
                if !ready {
                    return Err(self.short_circuit("circuit open"));
                }
                tracing::info!("Circuit for {} half-open, probing", self.provider);
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                inner.probe_in_flight = true;
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.short_circuit("circuit half-open, probe in flight"));
                }
                inner.probe_in_flight = true;
                Ok(Admission::Probe)
            }
        }
    }

    fn short_circuit(&self, reason: &str) -> TranscriptionError {
        tracing::debug!("Short-circuiting call to {}: {}", self.provider, reason);
        TranscriptionError::ProviderUnavailable(format!("{} ({})", self.provider, reason))
    }

    pub fn record_success(&self) {
        let success_threshold = self.config.lock().success_threshold;
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= success_threshold {
                    tracing::info!("Circuit for {} closed", self.provider);
                    *inner = BreakerInner::closed();
                }
            }
            _ => {
                inner.failure_count = 0;
            }
        }
    }

    pub fn record_failure(&self) {
        let config = self.config();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!("Probe to {} failed, circuit re-opened", self.provider);
                Self::trip(&mut inner, config.timeout);
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= config.failure_threshold {
                    tracing::warn!(
                        "Circuit for {} opened after {} consecutive failures",
                        self.provider,
                        inner.failure_count
                    );
                    Self::trip(&mut inner, config.timeout);
                }
            }
            CircuitState::Open => {
                inner.next_attempt = Some(Instant::now() + config.timeout);
            }
        }
    }

    fn trip(inner: &mut BreakerInner, timeout: Duration) {
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.probe_in_flight = false;
        inner.next_attempt = Some(Instant::now() + timeout);
    }

    /// Force the breaker closed with zeroed counters
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::closed();
        tracing::info!("Circuit for {} manually reset", self.provider);
    }
}
