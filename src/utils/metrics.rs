//! Provider Metrics
//!
//! Running per-provider statistics that the selection strategies read.
//! Each provider's counters sit behind their own lock so an update is never
//! torn or lost when calls complete concurrently.

use crate::transcription::{ErrorKind, ProviderId, TranscriptionError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Window over which availability recovers after a failure
pub const DEFAULT_AVAILABILITY_WINDOW: Duration = Duration::from_secs(300);

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Most recent failure for a provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    pub message: String,
    pub kind: ErrorKind,
    /// Unix time in milliseconds
    pub timestamp_ms: u64,
}

/// Counters and running averages for one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Milliseconds, averaged over successful requests
    pub average_latency: f64,
    /// USD, averaged over successful requests
    pub average_cost: f64,
    pub last_error: Option<LastError>,
}

impl ProviderMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    /// Success rate, scaled down right after a failure and recovering
    /// linearly across `window`. Optimistic (1.0) before any request.
    pub fn availability(&self, now_ms: u64, window: Duration) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        let success_rate = self.success_rate();

        match &self.last_error {
            Some(err) => {
                let window_ms = window.as_millis() as f64;
                if window_ms <= 0.0 {
                    return success_rate;
                }
                let since = now_ms.saturating_sub(err.timestamp_ms) as f64;
                success_rate * (since / window_ms).min(1.0)
            }
            None => success_rate,
        }
    }
}

/// Derived view used by selection and reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub total_requests: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub average_latency: f64,
    pub average_cost: f64,
    pub availability: f64,
}

/// Outcome of one provider call
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome<'a> {
    pub success: bool,
    /// Milliseconds
    pub latency: Option<f64>,
    /// USD
    pub cost: Option<f64>,
    pub error: Option<&'a TranscriptionError>,
}

impl<'a> RequestOutcome<'a> {
    pub fn success(latency: Option<f64>, cost: Option<f64>) -> Self {
        Self {
            success: true,
            latency,
            cost,
            error: None,
        }
    }

    pub fn failure(error: &'a TranscriptionError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Single source of truth for provider performance numbers
pub struct MetricsTracker {
    providers: BTreeMap<ProviderId, Mutex<ProviderMetrics>>,
    availability_window: Mutex<Duration>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::with_availability_window(DEFAULT_AVAILABILITY_WINDOW)
    }

    pub fn with_availability_window(window: Duration) -> Self {
        Self {
            providers: ProviderId::all()
                .iter()
                .map(|id| (*id, Mutex::new(ProviderMetrics::default())))
                .collect(),
            availability_window: Mutex::new(window),
        }
    }

    pub fn availability_window(&self) -> Duration {
        *self.availability_window.lock()
    }

    /// Applies to every later availability reading; counters are untouched
    pub fn set_availability_window(&self, window: Duration) {
        *self.availability_window.lock() = window;
    }

    fn slot(&self, provider: ProviderId) -> &Mutex<ProviderMetrics> {
        // Every ProviderId is inserted at construction
        &self.providers[&provider]
    }

    /// Fold one call outcome into the provider's statistics
    pub fn record_request(&self, provider: ProviderId, outcome: RequestOutcome<'_>) {
        self.record_request_at(provider, outcome, now_ms());
    }

    fn record_request_at(&self, provider: ProviderId, outcome: RequestOutcome<'_>, now_ms: u64) {
        let mut m = self.slot(provider).lock();
        m.total_requests += 1;

        if outcome.success {
            m.successful_requests += 1;
            let n = m.successful_requests as f64;
            if let Some(latency) = outcome.latency {
                m.average_latency = (m.average_latency * (n - 1.0) + latency) / n;
            }
            if let Some(cost) = outcome.cost {
                m.average_cost = (m.average_cost * (n - 1.0) + cost) / n;
            }
        } else {
            m.failed_requests += 1;
            let (message, kind) = match outcome.error {
                Some(err) => (err.to_string(), err.kind()),
                None => ("Unknown error".to_string(), ErrorKind::Failed),
            };
            m.last_error = Some(LastError {
                message,
                kind,
                timestamp_ms: now_ms,
            });
        }
    }

    /// Copy of one provider's counters
    pub fn get_metrics(&self, provider: ProviderId) -> ProviderMetrics {
        self.slot(provider).lock().clone()
    }

    /// Copy of every provider's counters
    pub fn snapshot(&self) -> BTreeMap<ProviderId, ProviderMetrics> {
        self.providers
            .iter()
            .map(|(id, m)| (*id, m.lock().clone()))
            .collect()
    }

    pub fn get_success_rate(&self, provider: ProviderId) -> f64 {
        self.slot(provider).lock().success_rate()
    }

    pub fn availability(&self, provider: ProviderId) -> f64 {
        self.availability_at(provider, now_ms())
    }

    pub fn availability_at(&self, provider: ProviderId, now_ms: u64) -> f64 {
        let window = self.availability_window();
        self.slot(provider).lock().availability(now_ms, window)
    }

    pub fn get_performance_stats(&self, provider: ProviderId) -> PerformanceStats {
        let window = self.availability_window();
        let m = self.slot(provider).lock();
        let success_rate = m.success_rate();
        PerformanceStats {
            total_requests: m.total_requests,
            success_rate,
            error_rate: 1.0 - success_rate,
            average_latency: m.average_latency,
            average_cost: m.average_cost,
            availability: m.availability(now_ms(), window),
        }
    }

    /// Zero one provider's counters, or all of them
    pub fn reset_metrics(&self, provider: Option<ProviderId>) {
        match provider {
            Some(id) => *self.slot(id).lock() = ProviderMetrics::default(),
            None => {
                for m in self.providers.values() {
                    *m.lock() = ProviderMetrics::default();
                }
            }
        }
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}
