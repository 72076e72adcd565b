//! Provider Selection
//!
//! Strategy-driven choice among the enabled providers. Selection only reads
//! metrics; the round-robin counter is the sole state it owns.

use super::{ProviderId, TranscriptionError};
use crate::utils::MetricsTracker;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Latency at or above which a provider scores the worst latency term
const LATENCY_CEILING_MS: f64 = 5000.0;

/// Selection strategy used when a provider is picked automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// First enabled provider
    #[default]
    Manual,
    CostOptimized,
    PerformanceOptimized,
    QualityOptimized,
    RoundRobin,
    /// Stable per-user split between the first two providers
    AbTest,
}

/// A provider as seen by the selector
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: ProviderId,
    pub enabled: bool,
    /// Static price, used until the provider has cost samples
    pub cost_per_minute: Option<f64>,
}

impl Candidate {
    pub fn new(id: ProviderId, enabled: bool) -> Self {
        Self {
            id,
            enabled,
            cost_per_minute: None,
        }
    }

    pub fn with_cost(mut self, cost_per_minute: Option<f64>) -> Self {
        self.cost_per_minute = cost_per_minute;
        self
    }
}

/// Picks a provider according to a [`SelectionStrategy`]
#[derive(Debug)]
pub struct ProviderSelector {
    counter: AtomicUsize,
    traffic_split: f64,
}

impl ProviderSelector {
    pub fn new(traffic_split: f64) -> Self {
        Self {
            counter: AtomicUsize::new(0),
            traffic_split,
        }
    }

    pub fn traffic_split(&self) -> f64 {
        self.traffic_split
    }

    pub fn set_traffic_split(&mut self, traffic_split: f64) {
        self.traffic_split = traffic_split;
    }

    /// Restart the round-robin rotation
    pub fn reset(&self) {
        self.counter.store(0, Ordering::SeqCst);
    }

    /// Choose one of the enabled `candidates`, in their given order
    pub fn select(
        &self,
        strategy: SelectionStrategy,
        candidates: &[Candidate],
        metrics: &MetricsTracker,
        user_id: Option<&str>,
    ) -> Result<ProviderId, TranscriptionError> {
        let enabled: Vec<&Candidate> = candidates.iter().filter(|c| c.enabled).collect();
        if enabled.is_empty() {
            return Err(TranscriptionError::NoProviderAvailable(
                "no providers available".to_string(),
            ));
        }

        let chosen = match strategy {
            SelectionStrategy::Manual => enabled[0].id,
            SelectionStrategy::CostOptimized => Self::cheapest(&enabled, metrics),
            SelectionStrategy::PerformanceOptimized => {
                Self::best_by(&enabled, |id| Self::performance_score(id, metrics))
            }
            SelectionStrategy::QualityOptimized => {
                Self::best_by(&enabled, |id| Self::quality_score(id, metrics))
            }
            SelectionStrategy::RoundRobin => self.next_in_rotation(&enabled),
            SelectionStrategy::AbTest => match user_id {
                Some(user_id) => self.ab_bucket(&enabled, user_id),
                None => self.next_in_rotation(&enabled),
            },
        };

        tracing::debug!("Selected provider {} using {:?}", chosen, strategy);
        Ok(chosen)
    }

    fn cheapest(enabled: &[&Candidate], metrics: &MetricsTracker) -> ProviderId {
        let cost = |c: &Candidate| {
            let m = metrics.get_metrics(c.id);
            if m.successful_requests > 0 {
                m.average_cost
            } else {
                c.cost_per_minute
                    .unwrap_or_else(|| c.id.default_cost_per_minute())
            }
        };

        let mut best = enabled[0];
        let mut best_cost = cost(best);
        for &candidate in &enabled[1..] {
            let c = cost(candidate);
            if c < best_cost {
                best = candidate;
                best_cost = c;
            }
        }
        best.id
    }

    /// Highest score wins; ties keep the earlier candidate
    fn best_by(enabled: &[&Candidate], score: impl Fn(ProviderId) -> f64) -> ProviderId {
        let mut best = enabled[0].id;
        let mut best_score = score(best);
        for candidate in &enabled[1..] {
            let s = score(candidate.id);
            if s > best_score {
                best = candidate.id;
                best_score = s;
            }
        }
        best
    }

    pub(crate) fn performance_score(id: ProviderId, metrics: &MetricsTracker) -> f64 {
        let m = metrics.get_metrics(id);
        let normalized_latency = (m.average_latency / LATENCY_CEILING_MS).min(1.0);
        -0.4 * normalized_latency + 0.4 * m.success_rate() + 0.2 * metrics.availability(id)
    }

    pub(crate) fn quality_score(id: ProviderId, metrics: &MetricsTracker) -> f64 {
        0.7 * metrics.get_success_rate(id) + 0.3 * metrics.availability(id)
    }

    fn next_in_rotation(&self, enabled: &[&Candidate]) -> ProviderId {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        enabled[n % enabled.len()].id
    }

    fn ab_bucket(&self, enabled: &[&Candidate], user_id: &str) -> ProviderId {
        if user_hash_fraction(user_id) < self.traffic_split || enabled.len() < 2 {
            enabled[0].id
        } else {
            enabled[1].id
        }
    }
}

impl Default for ProviderSelector {
    fn default() -> Self {
        Self::new(0.5)
    }
}

/// Stable hash of a user id mapped onto `[0, 1]`.
///
/// Folds UTF-16 code units with `h = h * 31 + c` in wrapping 32-bit
/// arithmetic, so ids bucket identically across processes and platforms.
pub fn user_hash_fraction(user_id: &str) -> f64 {
    let hash = user_id.encode_utf16().fold(0i32, |h, c| {
        h.wrapping_shl(5).wrapping_sub(h).wrapping_add(i32::from(c))
    });
    (i64::from(hash)).abs() as f64 / i32::MAX as f64
}
