//! Metrics Reporter
//!
//! Ships metrics snapshots to an external monitoring endpoint and raises
//! log alerts when thresholds are crossed.

use super::{MetricsTracker, ProviderMetrics};
use crate::config::MonitoringSettings;
use crate::transcription::ProviderId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

const REPORT_TIMEOUT_SECONDS: u64 = 5;

#[derive(Debug, Serialize)]
struct MetricsReport<'a> {
    timestamp_ms: u64,
    experiment_id: Option<&'a str>,
    providers: BTreeMap<ProviderId, ProviderMetrics>,
}

/// Fire-and-forget metrics shipper
pub struct MetricsReporter {
    settings: MonitoringSettings,
    experiment_id: Option<String>,
    client: reqwest::Client,
}

impl MetricsReporter {
    pub fn new(settings: MonitoringSettings, experiment_id: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REPORT_TIMEOUT_SECONDS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            settings,
            experiment_id,
            client,
        }
    }

    /// Whether snapshots are shipped anywhere
    pub fn is_shipping(&self) -> bool {
        self.settings.enabled && self.settings.metrics_endpoint.is_some()
    }

    /// Log a warning for any threshold the provider currently exceeds.
    /// Returns the number of alerts raised.
    pub fn check_thresholds(&self, provider: ProviderId, metrics: &MetricsTracker) -> usize {
        if !self.settings.enabled {
            return 0;
        }
        let stats = metrics.get_performance_stats(provider);
        let thresholds = &self.settings.alert_thresholds;
        let mut alerts = 0;

        if stats.total_requests > 0 && stats.error_rate > thresholds.error_rate {
            tracing::warn!(
                "{} error rate {:.1}% exceeds alert threshold {:.1}%",
                provider,
                stats.error_rate * 100.0,
                thresholds.error_rate * 100.0
            );
            alerts += 1;
        }
        if stats.average_latency > thresholds.latency_ms {
            tracing::warn!(
                "{} average latency {:.0}ms exceeds alert threshold {:.0}ms",
                provider,
                stats.average_latency,
                thresholds.latency_ms
            );
            alerts += 1;
        }
        alerts
    }

    /// Post the current snapshot without waiting for the result.
    /// Does nothing outside a tokio runtime.
    pub fn ship(&self, metrics: &MetricsTracker) {
        let Some(endpoint) = self.settings.metrics_endpoint.clone().filter(|_| self.settings.enabled) else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No async runtime, skipping metrics shipment");
            return;
        };

        let report = MetricsReport {
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            experiment_id: self.experiment_id.as_deref(),
            providers: metrics.snapshot(),
        };
        let body = match serde_json::to_value(&report) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Failed to serialize metrics report: {}", e);
                return;
            }
        };

        let client = self.client.clone();
        handle.spawn(async move {
            match client.post(&endpoint).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!("Metrics shipped to {}", endpoint);
                }
                Ok(resp) => {
                    tracing::warn!("Metrics endpoint {} returned {}", endpoint, resp.status());
                }
                Err(e) => {
                    tracing::warn!("Failed to ship metrics to {}: {}", endpoint, e);
                }
            }
        });
    }
}
