//! Transcriber Factory
//!
//! Single entry point for obtaining a ready-to-use provider. Owns the
//! configured providers (each wrapped in the reliability pipeline), the
//! metrics tracker and the selector, and rebuilds providers whenever the
//! configuration changes.

use super::{
    Candidate, CircuitBreaker, CircuitBreakerConfig, CircuitState, DeepgramProvider,
    ProviderId, ProviderSelector, RateLimiter, ReliableProvider, RetryPolicy,
    SelectionStrategy, TranscriptionError, TranscriptionOptions, TranscriptionProvider,
    TranscriptionResponse, WhisperProvider,
};
use crate::config::{
    ConfigUpdate, ProviderConfig, ReliabilitySettings, Settings, SettingsError, SettingsStore,
};
use crate::utils::{MetricsReporter, MetricsTracker, PerformanceStats, ProviderMetrics, RequestOutcome};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which provider the caller wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderPreference {
    /// Let the configured selection strategy decide
    Auto,
    Specific(ProviderId),
}

impl From<ProviderId> for ProviderPreference {
    fn from(id: ProviderId) -> Self {
        Self::Specific(id)
    }
}

/// Constructs the raw (unguarded) provider for an id
pub trait ProviderBuilder: Send + Sync {
    fn build(
        &self,
        id: ProviderId,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn TranscriptionProvider>, TranscriptionError>;
}

impl<F> ProviderBuilder for F
where
    F: Fn(ProviderId, &ProviderConfig) -> Result<Arc<dyn TranscriptionProvider>, TranscriptionError>
        + Send
        + Sync,
{
    fn build(
        &self,
        id: ProviderId,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn TranscriptionProvider>, TranscriptionError> {
        self(id, config)
    }
}

/// Builds the HTTP adapters
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProviderBuilder;

impl ProviderBuilder for HttpProviderBuilder {
    fn build(
        &self,
        id: ProviderId,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn TranscriptionProvider>, TranscriptionError> {
        let provider: Arc<dyn TranscriptionProvider> = match id {
            ProviderId::Whisper => Arc::new(WhisperProvider::new(config.clone())?),
            ProviderId::Deepgram => Arc::new(DeepgramProvider::new(config.clone())?),
        };
        Ok(provider)
    }
}

fn breaker_config(reliability: &ReliabilitySettings) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: reliability.failure_threshold,
        success_threshold: reliability.success_threshold,
        timeout: Duration::from_secs(reliability.open_timeout_seconds),
    }
}

fn retry_policy(reliability: &ReliabilitySettings) -> RetryPolicy {
    RetryPolicy::new(
        reliability.max_retries,
        Duration::from_millis(reliability.base_delay_ms),
        Duration::from_millis(reliability.max_delay_ms),
    )
    .with_jitter(Duration::from_millis(reliability.jitter_ms))
}

/// Provider registry, selection and metrics feedback
pub struct TranscriberFactory {
    settings: RwLock<Settings>,
    store: Arc<dyn SettingsStore>,
    builder: Box<dyn ProviderBuilder>,
    providers: RwLock<BTreeMap<ProviderId, Arc<ReliableProvider>>>,
    /// One per provider id, kept across reconfiguration
    breakers: BTreeMap<ProviderId, Arc<CircuitBreaker>>,
    metrics: Arc<MetricsTracker>,
    selector: RwLock<ProviderSelector>,
    reporter: RwLock<MetricsReporter>,
}

impl TranscriberFactory {
    /// Load settings from `store` and build the HTTP providers
    pub fn new(store: Arc<dyn SettingsStore>) -> Result<Self, SettingsError> {
        Self::with_builder(store, HttpProviderBuilder)
    }

    /// Load settings from `store` and build providers with `builder`
    pub fn with_builder(
        store: Arc<dyn SettingsStore>,
        builder: impl ProviderBuilder + 'static,
    ) -> Result<Self, SettingsError> {
        let settings = store.load()?;
        Self::check(&settings)?;

        let breakers = ProviderId::all()
            .iter()
            .map(|id| {
                let breaker = CircuitBreaker::new(*id, breaker_config(&settings.reliability));
                (*id, Arc::new(breaker))
            })
            .collect();

        let metrics = MetricsTracker::with_availability_window(Duration::from_secs(
            settings.reliability.availability_window_seconds,
        ));

        let factory = Self {
            selector: RwLock::new(ProviderSelector::new(settings.ab_test.traffic_split)),
            reporter: RwLock::new(MetricsReporter::new(
                settings.monitoring.clone(),
                settings.ab_test.experiment_id.clone(),
            )),
            settings: RwLock::new(settings),
            store,
            builder: Box::new(builder),
            providers: RwLock::new(BTreeMap::new()),
            breakers,
            metrics: Arc::new(metrics),
        };
        factory.reinitialize();

        Ok(factory)
    }

    /// Reject structurally invalid settings. A missing credential only
    /// disables that provider, so it is logged rather than returned.
    fn check(settings: &Settings) -> Result<(), SettingsError> {
        match settings.validate() {
            Ok(()) => Ok(()),
            Err(SettingsError::MissingApiKey(id)) => {
                tracing::warn!("{} is enabled but has no API key; it will be skipped", id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Rebuild every provider from the current settings.
    ///
    /// A provider that fails to build is logged and left out; the others
    /// still come up.
    fn reinitialize(&self) {
        let settings = self.settings.read().clone();
        let mut built = BTreeMap::new();

        // Breakers keep their state; only the thresholds follow the settings
        let thresholds = breaker_config(&settings.reliability);
        for breaker in self.breakers.values() {
            breaker.set_config(thresholds.clone());
        }
        self.metrics.set_availability_window(Duration::from_secs(
            settings.reliability.availability_window_seconds,
        ));

        for id in ProviderId::all() {
            let config = settings.providers.get(*id);
            if !config.enabled {
                continue;
            }

            let Some(breaker) = self.breakers.get(id) else {
                continue;
            };

            match self.builder.build(*id, config) {
                Ok(inner) => {
                    let provider = ReliableProvider::new(
                        inner,
                        RateLimiter::with_interval(config.rate_limit.min_interval()),
                        Arc::clone(breaker),
                        retry_policy(&settings.reliability),
                    )
                    .with_max_concurrency(config.max_concurrency);
                    built.insert(*id, Arc::new(provider));
                    tracing::info!("Initialized provider {} (model: {})", id, config.model);
                }
                Err(e) => {
                    tracing::warn!("Failed to initialize provider {}: {}", id, e);
                }
            }
        }

        *self.providers.write() = built;
        self.selector
            .write()
            .set_traffic_split(settings.ab_test.traffic_split);
        *self.reporter.write() = MetricsReporter::new(
            settings.monitoring.clone(),
            settings.ab_test.experiment_id.clone(),
        );
    }

    // ------------------------------------------------------------
    // Provider lookup
    // ------------------------------------------------------------

    /// Resolve a provider for the given preference
    pub fn get_provider(
        &self,
        preference: Option<ProviderPreference>,
    ) -> Result<Arc<ReliableProvider>, TranscriptionError> {
        let (default_provider, auto_select, strategy, fallback_enabled) = {
            let s = self.settings.read();
            (
                s.default_provider,
                s.auto_select,
                s.selection_strategy,
                s.fallback_enabled,
            )
        };

        match preference {
            Some(ProviderPreference::Specific(id)) => self.specific(id, fallback_enabled),
            Some(ProviderPreference::Auto) => self.select(strategy, None),
            None if auto_select => self.select(strategy, None),
            None => {
                let providers = self.providers.read();
                providers
                    .get(&default_provider)
                    .or_else(|| providers.values().next())
                    .cloned()
                    .ok_or_else(|| {
                        TranscriptionError::NoProviderAvailable(
                            "no provider available".to_string(),
                        )
                    })
            }
        }
    }

    /// Resolve a provider for a user taking part in the A/B experiment
    pub fn get_provider_for_ab_test(
        &self,
        user_id: &str,
    ) -> Result<Arc<ReliableProvider>, TranscriptionError> {
        if !self.settings.read().ab_test.enabled {
            return self.get_provider(None);
        }
        self.select(SelectionStrategy::AbTest, Some(user_id))
    }

    fn specific(
        &self,
        id: ProviderId,
        fallback_enabled: bool,
    ) -> Result<Arc<ReliableProvider>, TranscriptionError> {
        let providers = self.providers.read();
        if let Some(provider) = providers.get(&id) {
            return Ok(Arc::clone(provider));
        }

        if !fallback_enabled {
            return Err(TranscriptionError::ProviderUnavailable(format!(
                "{} is not enabled",
                id
            )));
        }

        match providers.iter().find(|(other, _)| **other != id) {
            Some((other, provider)) => {
                tracing::info!("{} is not enabled, falling back to {}", id, other);
                Ok(Arc::clone(provider))
            }
            None => Err(TranscriptionError::NoProviderAvailable(format!(
                "{} is not enabled and no fallback is available",
                id
            ))),
        }
    }

    fn select(
        &self,
        strategy: SelectionStrategy,
        user_id: Option<&str>,
    ) -> Result<Arc<ReliableProvider>, TranscriptionError> {
        let providers = self.providers.read();
        let candidates: Vec<Candidate> = ProviderId::all()
            .iter()
            .map(|id| match providers.get(id) {
                Some(p) => Candidate::new(*id, true).with_cost(p.cost_per_minute()),
                None => Candidate::new(*id, false),
            })
            .collect();

        let id = self
            .selector
            .read()
            .select(strategy, &candidates, &self.metrics, user_id)?;

        providers.get(&id).cloned().ok_or_else(|| {
            TranscriptionError::NoProviderAvailable(format!("{} is not enabled", id))
        })
    }

    /// Ids of the providers currently built and enabled
    pub fn enabled_providers(&self) -> Vec<ProviderId> {
        self.providers.read().keys().copied().collect()
    }

    // ------------------------------------------------------------
    // Transcription and metrics
    // ------------------------------------------------------------

    /// Resolve a provider, transcribe with it and record the outcome
    pub async fn transcribe(
        &self,
        preference: Option<ProviderPreference>,
        audio: &[u8],
        options: &TranscriptionOptions,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        let provider = self.get_provider(preference)?;
        let id = provider.id();

        // Callers that leave diarization unset get the configured rules
        let configured;
        let options = if options.diarization.is_none() {
            configured = TranscriptionOptions {
                diarization: Some(self.settings.read().diarization.clone()),
                ..options.clone()
            };
            &configured
        } else {
            options
        };

        let start = Instant::now();
        let result = provider.transcribe(audio, options).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(response) => {
                let cost = response
                    .duration
                    .zip(provider.cost_per_minute())
                    .map(|(seconds, per_minute)| seconds / 60.0 * per_minute);
                self.record_metrics(id, true, Some(latency_ms), cost, None);
            }
            Err(e) => {
                tracing::warn!("Transcription with {} failed: {}", id, e);
                self.record_metrics(id, false, None, None, Some(e));
            }
        }

        result
    }

    /// Feed one call's outcome into the tracker and the monitoring shipper
    pub fn record_metrics(
        &self,
        provider: ProviderId,
        success: bool,
        latency: Option<f64>,
        cost: Option<f64>,
        error: Option<&TranscriptionError>,
    ) {
        self.metrics.record_request(
            provider,
            RequestOutcome {
                success,
                latency,
                cost,
                error,
            },
        );

        let reporter = self.reporter.read();
        reporter.check_thresholds(provider, &self.metrics);
        reporter.ship(&self.metrics);
    }

    /// Abort in-flight calls of one provider
    pub fn cancel(&self, provider: ProviderId) {
        if let Some(p) = self.providers.read().get(&provider) {
            p.cancel();
        }
    }

    pub fn metrics(&self) -> Arc<MetricsTracker> {
        Arc::clone(&self.metrics)
    }

    pub fn provider_metrics(&self) -> BTreeMap<ProviderId, ProviderMetrics> {
        self.metrics.snapshot()
    }

    pub fn performance_stats(&self, provider: ProviderId) -> PerformanceStats {
        self.metrics.get_performance_stats(provider)
    }

    pub fn reset_metrics(&self, provider: Option<ProviderId>) {
        self.metrics.reset_metrics(provider);
    }

    pub fn circuit_state(&self, provider: ProviderId) -> Option<CircuitState> {
        self.breakers.get(&provider).map(|b| b.state())
    }

    /// Force a provider's circuit closed
    pub fn reset_circuit(&self, provider: ProviderId) {
        if let Some(breaker) = self.breakers.get(&provider) {
            breaker.reset();
            tracing::info!("Circuit for {} reset", provider);
        }
    }

    pub fn reset_selection(&self) {
        self.selector.read().reset();
    }

    // ------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------

    /// Current settings snapshot
    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Apply a partial update, persist it and rebuild every provider
    pub fn update_config(&self, update: ConfigUpdate) -> Result<(), SettingsError> {
        let mut next = self.settings.read().clone();
        next.apply(update);
        self.commit(next)
    }

    /// Enable or disable one provider
    pub fn toggle_provider(&self, provider: ProviderId, enabled: bool) -> Result<(), SettingsError> {
        let mut next = self.settings.read().clone();
        next.providers.get_mut(provider).enabled = enabled;
        self.commit(next)
    }

    pub fn set_default_provider(&self, provider: ProviderId) -> Result<(), SettingsError> {
        let mut next = self.settings.read().clone();
        next.default_provider = provider;
        self.commit(next)
    }

    fn commit(&self, next: Settings) -> Result<(), SettingsError> {
        Self::check(&next)?;
        self.store.save(&next)?;
        *self.settings.write() = next;
        self.reinitialize();
        Ok(())
    }
}
