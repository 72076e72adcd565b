//! Settings Definition
//!
//! Provider orchestration configuration schema. Every section is fully
//! defaulted at load time so read sites never deal with missing fields.

use crate::transcription::{DiarizationConfig, ProviderId, SelectionStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Main settings structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Provider used when no preference is given and auto-select is off
    pub default_provider: ProviderId,
    /// Resolve unqualified requests through the selection strategy
    pub auto_select: bool,
    pub selection_strategy: SelectionStrategy,
    /// Substitute another enabled provider when the requested one is unusable
    pub fallback_enabled: bool,
    pub providers: ProvidersSettings,
    pub ab_test: AbTestSettings,
    pub monitoring: MonitoringSettings,
    pub reliability: ReliabilitySettings,
    pub diarization: DiarizationConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_provider: ProviderId::Whisper,
            auto_select: false,
            selection_strategy: SelectionStrategy::Manual,
            fallback_enabled: true,
            providers: ProvidersSettings::default(),
            ab_test: AbTestSettings::default(),
            monitoring: MonitoringSettings::default(),
            reliability: ReliabilitySettings::default(),
            diarization: DiarizationConfig::default(),
        }
    }
}

impl Settings {
    /// Validate settings
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(0.0..=1.0).contains(&self.ab_test.traffic_split) {
            return Err(SettingsError::Invalid(format!(
                "ab_test.traffic_split must be within [0, 1], got {}",
                self.ab_test.traffic_split
            )));
        }

        for id in ProviderId::all() {
            if self.providers.get(*id).rate_limit.window_seconds == 0 {
                return Err(SettingsError::Invalid(format!(
                    "{}: rate_limit.window_seconds must be positive",
                    id
                )));
            }
        }

        for id in ProviderId::all() {
            let provider = self.providers.get(*id);
            if provider.enabled && !provider.has_api_key() {
                return Err(SettingsError::MissingApiKey(*id));
            }
        }

        if self.monitoring.enabled && self.monitoring.metrics_endpoint.is_none() {
            tracing::debug!("Monitoring enabled without an endpoint; metrics stay local");
        }

        Ok(())
    }

    /// Apply a partial update; provided fields replace current values
    pub fn apply(&mut self, update: ConfigUpdate) {
        if let Some(id) = update.default_provider {
            self.default_provider = id;
        }
        if let Some(auto) = update.auto_select {
            self.auto_select = auto;
        }
        if let Some(strategy) = update.selection_strategy {
            self.selection_strategy = strategy;
        }
        if let Some(fallback) = update.fallback_enabled {
            self.fallback_enabled = fallback;
        }
        if let Some(whisper) = update.whisper {
            self.providers.whisper = whisper;
        }
        if let Some(deepgram) = update.deepgram {
            self.providers.deepgram = deepgram;
        }
        if let Some(ab_test) = update.ab_test {
            self.ab_test = ab_test;
        }
        if let Some(monitoring) = update.monitoring {
            self.monitoring = monitoring;
        }
        if let Some(reliability) = update.reliability {
            self.reliability = reliability;
        }
        if let Some(diarization) = update.diarization {
            self.diarization = diarization;
        }
    }
}

/// Partial settings update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub default_provider: Option<ProviderId>,
    pub auto_select: Option<bool>,
    pub selection_strategy: Option<SelectionStrategy>,
    pub fallback_enabled: Option<bool>,
    pub whisper: Option<ProviderConfig>,
    pub deepgram: Option<ProviderConfig>,
    pub ab_test: Option<AbTestSettings>,
    pub monitoring: Option<MonitoringSettings>,
    pub reliability: Option<ReliabilitySettings>,
    pub diarization: Option<DiarizationConfig>,
}

/// Per-provider configuration, keyed by provider id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersSettings {
    pub whisper: ProviderConfig,
    pub deepgram: ProviderConfig,
}

impl Default for ProvidersSettings {
    fn default() -> Self {
        Self {
            whisper: ProviderConfig::with_model("whisper-1"),
            deepgram: ProviderConfig::with_model("nova-2"),
        }
    }
}

impl ProvidersSettings {
    pub fn get(&self, id: ProviderId) -> &ProviderConfig {
        match id {
            ProviderId::Whisper => &self.whisper,
            ProviderId::Deepgram => &self.deepgram,
        }
    }

    pub fn get_mut(&mut self, id: ProviderId) -> &mut ProviderConfig {
        match id {
            ProviderId::Whisper => &mut self.whisper,
            ProviderId::Deepgram => &mut self.deepgram,
        }
    }
}

/// Settings for one provider
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub model: String,
    pub max_concurrency: u32,
    /// Base request timeout in seconds, scaled up for large uploads
    pub timeout_seconds: u64,
    pub rate_limit: RateLimitSettings,
    /// Overrides the provider's public API endpoint
    pub base_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            model: String::new(),
            max_concurrency: 4,
            timeout_seconds: 30,
            rate_limit: RateLimitSettings::default(),
            base_url: None,
        }
    }
}

impl ProviderConfig {
    pub fn with_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Self::default()
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

// Keep credentials out of logs
impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("enabled", &self.enabled)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("max_concurrency", &self.max_concurrency)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("rate_limit", &self.rate_limit)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Outbound request budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Requests allowed per window (0 = unlimited)
    pub requests: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests: 60,
            window_seconds: 60,
        }
    }
}

impl RateLimitSettings {
    /// Minimum spacing between dispatches, `None` when unlimited
    pub fn min_interval(&self) -> Option<Duration> {
        if self.requests == 0 {
            return None;
        }
        Some(Duration::from_secs(self.window_seconds) / self.requests)
    }
}

/// A/B experiment routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbTestSettings {
    pub enabled: bool,
    /// Share of users routed to the first provider
    pub traffic_split: f64,
    pub experiment_id: Option<String>,
}

impl Default for AbTestSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            traffic_split: 0.5,
            experiment_id: None,
        }
    }
}

/// External metrics shipping
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub enabled: bool,
    pub metrics_endpoint: Option<String>,
    pub alert_thresholds: AlertThresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Error rate above which a warning is logged
    pub error_rate: f64,
    /// Average latency (ms) above which a warning is logged
    pub latency_ms: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.1,
            latency_ms: 10_000.0,
        }
    }
}

/// Circuit breaker, retry and availability tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilitySettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_seconds: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub availability_window_seconds: u64,
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_seconds: 60,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter_ms: 1000,
            availability_window_seconds: 300,
        }
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid settings: {0}")]
    Invalid(String),

    #[error("Missing API key for enabled provider {0}")]
    MissingApiKey(ProviderId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),
}
