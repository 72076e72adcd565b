//! Integration Tests for the Transcription Pipeline
//!
//! Tests the complete flow: TranscriberFactory -> selection -> RateLimiter ->
//! CircuitBreaker -> RetryPolicy -> provider adapter -> diarization -> metrics
//!
//! These tests verify:
//! 1. HTTP adapters and the diarization formatter cooperate end to end
//! 2. Error handling cascades properly through the reliability guards
//! 3. Configuration changes are persisted and take effect

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use voxrelay_lib::config::{
    ConfigUpdate, FileSettingsStore, MemorySettingsStore, ProviderConfig, RateLimitSettings,
    Settings, SettingsStore,
};
use voxrelay_lib::transcription::{
    CircuitState, ErrorKind, InFlightCalls, ProviderBuilder, ProviderCapabilities, ProviderId,
    ProviderPreference, SelectionStrategy, TranscriberFactory, TranscriptionError,
    TranscriptionOptions, TranscriptionProvider, TranscriptionResponse,
};

// ============================================================================
// Test Fixtures and Mock Providers
// ============================================================================

/// Mock transcription provider with switchable behavior
struct MockProvider {
    id: ProviderId,
    config: ProviderConfig,
    failing: AtomicBool,
    hang: bool,
    calls: AtomicU32,
    in_flight: InFlightCalls,
}

impl MockProvider {
    fn new(id: ProviderId) -> Self {
        Self {
            id,
            config: enabled_config(None),
            failing: AtomicBool::new(false),
            hang: false,
            calls: AtomicU32::new(0),
            in_flight: InFlightCalls::new(),
        }
    }

    fn hanging(id: ProviderId) -> Self {
        Self {
            hang: true,
            ..Self::new(id)
        }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionProvider for MockProvider {
    async fn transcribe(
        &self,
        _audio: &[u8],
        _options: &TranscriptionOptions,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let call = self.in_flight.register();

        if self.hang {
            call.token()
                .run(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<(), TranscriptionError>(())
                })
                .await?;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(TranscriptionError::ProviderUnavailable(
                "503 Service Unavailable".to_string(),
            ));
        }

        Ok(TranscriptionResponse {
            text: format!("transcribed by {}", self.id),
            language: Some("en".to_string()),
            confidence: Some(0.95),
            duration: Some(30.0),
            segments: None,
            provider: self.id,
            metadata: None,
        })
    }

    async fn validate_api_key(&self, api_key: &str) -> bool {
        !api_key.is_empty()
    }

    fn cancel(&self) {
        self.in_flight.cancel_all();
    }

    fn id(&self) -> ProviderId {
        self.id
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn is_available(&self) -> bool {
        true
    }
}

fn enabled_config(base_url: Option<String>) -> ProviderConfig {
    ProviderConfig {
        enabled: true,
        api_key: Some("test-key".to_string()),
        base_url,
        // Unlimited, so real-time HTTP tests never wait on the limiter
        rate_limit: RateLimitSettings {
            requests: 0,
            window_seconds: 60,
        },
        ..ProviderConfig::default()
    }
}

fn settings_with(whisper: Option<ProviderConfig>, deepgram: Option<ProviderConfig>) -> Settings {
    let mut settings = Settings::default();
    if let Some(whisper) = whisper {
        settings.providers.whisper = whisper;
    }
    if let Some(deepgram) = deepgram {
        settings.providers.deepgram = deepgram;
    }
    settings.reliability.jitter_ms = 0;
    settings.reliability.base_delay_ms = 1;
    settings.reliability.max_delay_ms = 10;
    settings
}

fn mock_builder(mocks: Vec<Arc<MockProvider>>) -> impl ProviderBuilder + 'static {
    move |id: ProviderId, _config: &ProviderConfig| {
        mocks
            .iter()
            .find(|m| m.id == id)
            .map(|m| Arc::clone(m) as Arc<dyn TranscriptionProvider>)
            .ok_or_else(|| TranscriptionError::Failed(format!("no mock for {}", id)))
    }
}

/// Deepgram response for a two-speaker exchange
const TWO_SPEAKER_RESPONSE: &str = r#"{
    "metadata": {"request_id": "it-1", "duration": 4.8},
    "results": {"channels": [{
        "detected_language": "en",
        "alternatives": [{
            "transcript": "Hello how are you I am fine thanks",
            "confidence": 0.945,
            "words": [
                {"word": "Hello",  "start": 0.0, "end": 1.0, "confidence": 0.95, "speaker": 0},
                {"word": "how",    "start": 1.0, "end": 1.5, "confidence": 0.92, "speaker": 0},
                {"word": "are",    "start": 1.5, "end": 2.0, "confidence": 0.98, "speaker": 0},
                {"word": "you",    "start": 2.0, "end": 2.5, "confidence": 0.94, "speaker": 0},
                {"word": "I",      "start": 3.0, "end": 3.2, "confidence": 0.96, "speaker": 1},
                {"word": "am",     "start": 3.2, "end": 3.6, "confidence": 0.93, "speaker": 1},
                {"word": "fine",   "start": 3.6, "end": 4.2, "confidence": 0.97, "speaker": 1},
                {"word": "thanks", "start": 4.2, "end": 4.8, "confidence": 0.91, "speaker": 1}
            ]
        }]
    }]}
}"#;

// ============================================================================
// HTTP Pipeline Tests
// ============================================================================

#[tokio::test]
async fn test_deepgram_diarization_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/listen")
        .match_query(mockito::Matcher::UrlEncoded(
            "diarize".into(),
            "true".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(TWO_SPEAKER_RESPONSE)
        .create_async()
        .await;

    let settings = settings_with(None, Some(enabled_config(Some(server.url()))));
    let factory = TranscriberFactory::new(Arc::new(MemorySettingsStore::new(settings))).unwrap();

    let options = TranscriptionOptions {
        diarize: true,
        ..Default::default()
    };
    let response = factory
        .transcribe(Some(ProviderId::Deepgram.into()), b"RIFF....WAVE", &options)
        .await
        .unwrap();

    mock.assert_async().await;
    assert!(response.text.contains("Speaker 1: Hello how are you"));
    assert!(response.text.contains("Speaker 2: I am fine thanks"));
    assert_eq!(response.provider, ProviderId::Deepgram);

    let segments = response.segments.unwrap();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].speaker.as_deref(), Some("0"));
    assert_eq!(segments[1].speaker.as_deref(), Some("1"));
    assert_eq!(segments[1].start, 3.0);

    let metadata = response.metadata.unwrap();
    assert_eq!(metadata["diarization"]["speaker_count"], 2);

    let metrics = factory.metrics().get_metrics(ProviderId::Deepgram);
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.successful_requests, 1);
    let expected_cost = 4.8 / 60.0 * 0.0043;
    assert!((metrics.average_cost - expected_cost).abs() < 1e-12);
}

#[tokio::test]
async fn test_configured_speaker_labels_reach_formatter() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/listen")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(TWO_SPEAKER_RESPONSE)
        .expect(2)
        .create_async()
        .await;

    let mut settings = settings_with(None, Some(enabled_config(Some(server.url()))));
    settings.diarization.labels.custom_labels = vec!["Host".to_string(), "Guest".to_string()];
    let factory = TranscriberFactory::new(Arc::new(MemorySettingsStore::new(settings))).unwrap();

    let options = TranscriptionOptions {
        diarize: true,
        ..Default::default()
    };
    let response = factory
        .transcribe(Some(ProviderId::Deepgram.into()), b"RIFF....WAVE", &options)
        .await
        .unwrap();
    assert!(response.text.contains("Host: Hello how are you"));
    assert!(response.text.contains("Guest: I am fine thanks"));

    // An explicit per-call config wins over the configured one
    let options = TranscriptionOptions {
        diarize: true,
        diarization: Some(Default::default()),
        ..Default::default()
    };
    let response = factory
        .transcribe(Some(ProviderId::Deepgram.into()), b"RIFF....WAVE", &options)
        .await
        .unwrap();
    assert!(response.text.contains("Speaker 1: Hello how are you"));
}

#[tokio::test]
async fn test_whisper_fallback_over_http() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/audio/transcriptions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"text":"fallback worked","language":"en","duration":3.0}"#)
        .create_async()
        .await;

    let settings = settings_with(Some(enabled_config(Some(server.url()))), None);
    let factory = TranscriberFactory::new(Arc::new(MemorySettingsStore::new(settings))).unwrap();

    // Deepgram is not enabled; fallback routes to whisper
    let response = factory
        .transcribe(
            Some(ProviderId::Deepgram.into()),
            b"RIFF....WAVE",
            &TranscriptionOptions::default(),
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(response.text, "fallback worked");
    assert_eq!(response.provider, ProviderId::Whisper);
}

#[tokio::test]
async fn test_authentication_error_is_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/audio/transcriptions")
        .with_status(401)
        .with_body(r#"{"error":{"message":"Incorrect API key provided"}}"#)
        .expect(1)
        .create_async()
        .await;

    let settings = settings_with(Some(enabled_config(Some(server.url()))), None);
    let factory = TranscriberFactory::new(Arc::new(MemorySettingsStore::new(settings))).unwrap();

    let err = factory
        .transcribe(None, b"RIFF....WAVE", &TranscriptionOptions::default())
        .await
        .unwrap_err();

    mock.assert_async().await;
    assert_eq!(err.kind(), ErrorKind::Authentication);

    let metrics = factory.metrics().get_metrics(ProviderId::Whisper);
    assert_eq!(metrics.failed_requests, 1);
    assert_eq!(metrics.last_error.unwrap().kind, ErrorKind::Authentication);

    let provider = factory.get_provider(None).unwrap();
    assert_eq!(provider.breaker().failure_count(), 1);
}

// ============================================================================
// Reliability Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_and_recovers() {
    let whisper = Arc::new(MockProvider::new(ProviderId::Whisper));
    let mut settings = settings_with(Some(enabled_config(None)), None);
    settings.reliability.max_retries = 1;

    let factory = TranscriberFactory::with_builder(
        Arc::new(MemorySettingsStore::new(settings)),
        mock_builder(vec![whisper.clone()]),
    )
    .unwrap();

    whisper.set_failing(true);
    for _ in 0..5 {
        let err = factory
            .transcribe(None, b"audio", &TranscriptionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MaxRetriesExceeded);
    }
    assert_eq!(whisper.calls(), 5);
    assert_eq!(factory.circuit_state(ProviderId::Whisper), Some(CircuitState::Open));

    // Short-circuited without touching the provider, but still recorded
    let err = factory
        .transcribe(None, b"audio", &TranscriptionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
    assert_eq!(whisper.calls(), 5);
    assert_eq!(factory.performance_stats(ProviderId::Whisper).total_requests, 6);

    whisper.set_failing(false);
    tokio::time::advance(Duration::from_secs(61)).await;

    factory
        .transcribe(None, b"audio", &TranscriptionOptions::default())
        .await
        .unwrap();
    assert_eq!(factory.circuit_state(ProviderId::Whisper), Some(CircuitState::HalfOpen));

    factory
        .transcribe(None, b"audio", &TranscriptionOptions::default())
        .await
        .unwrap();
    assert_eq!(factory.circuit_state(ProviderId::Whisper), Some(CircuitState::Closed));
    assert_eq!(whisper.calls(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retried_within_one_call() {
    let whisper = Arc::new(MockProvider::new(ProviderId::Whisper));
    let settings = settings_with(Some(enabled_config(None)), None);

    let factory = TranscriberFactory::with_builder(
        Arc::new(MemorySettingsStore::new(settings)),
        mock_builder(vec![whisper.clone()]),
    )
    .unwrap();

    whisper.set_failing(true);
    let err = factory
        .transcribe(None, b"audio", &TranscriptionOptions::default())
        .await
        .unwrap_err();

    match err {
        TranscriptionError::MaxRetriesExceeded { attempts, source } => {
            assert_eq!(attempts, 3);
            assert_eq!(source.kind(), ErrorKind::ProviderUnavailable);
        }
        other => panic!("expected MaxRetriesExceeded, got {:?}", other),
    }
    assert_eq!(whisper.calls(), 3);

    let provider = factory.get_provider(None).unwrap();
    assert_eq!(provider.breaker().failure_count(), 1);
}

#[tokio::test]
async fn test_cancel_aborts_in_flight_call() {
    let whisper = Arc::new(MockProvider::hanging(ProviderId::Whisper));
    let settings = settings_with(Some(enabled_config(None)), None);

    let factory = Arc::new(
        TranscriberFactory::with_builder(
            Arc::new(MemorySettingsStore::new(settings)),
            mock_builder(vec![whisper.clone()]),
        )
        .unwrap(),
    );

    let task = {
        let factory = Arc::clone(&factory);
        tokio::spawn(async move {
            factory
                .transcribe(None, b"audio", &TranscriptionOptions::default())
                .await
        })
    };

    while whisper.in_flight.is_empty() {
        tokio::task::yield_now().await;
    }
    factory.cancel(ProviderId::Whisper);

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TranscriptionError::Cancelled)));

    let metrics = factory.metrics().get_metrics(ProviderId::Whisper);
    assert_eq!(metrics.failed_requests, 1);
    assert_eq!(metrics.last_error.unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(factory.circuit_state(ProviderId::Whisper), Some(CircuitState::Closed));
    assert!(whisper.in_flight.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_backoff() {
    let whisper = Arc::new(MockProvider::new(ProviderId::Whisper));
    let mut settings = settings_with(Some(enabled_config(None)), None);
    settings.reliability.base_delay_ms = 1000;
    settings.reliability.max_delay_ms = 10_000;

    let factory = Arc::new(
        TranscriberFactory::with_builder(
            Arc::new(MemorySettingsStore::new(settings)),
            mock_builder(vec![whisper.clone()]),
        )
        .unwrap(),
    );

    whisper.set_failing(true);
    let task = {
        let factory = Arc::clone(&factory);
        tokio::spawn(async move {
            factory
                .transcribe(None, b"audio", &TranscriptionOptions::default())
                .await
        })
    };

    // First attempt has failed; the call is sleeping before its retry
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(whisper.calls(), 1);
    factory.cancel(ProviderId::Whisper);

    let result = task.await.unwrap();
    assert!(matches!(result, Err(TranscriptionError::Cancelled)));
    assert_eq!(whisper.calls(), 1);

    let metrics = factory.metrics().get_metrics(ProviderId::Whisper);
    assert_eq!(metrics.last_error.unwrap().kind, ErrorKind::Cancelled);
    let provider = factory.get_provider(None).unwrap();
    assert_eq!(provider.breaker().failure_count(), 0);
}

// ============================================================================
// Selection Tests
// ============================================================================

#[tokio::test]
async fn test_round_robin_across_providers() {
    let whisper = Arc::new(MockProvider::new(ProviderId::Whisper));
    let deepgram = Arc::new(MockProvider::new(ProviderId::Deepgram));
    let mut settings = settings_with(Some(enabled_config(None)), Some(enabled_config(None)));
    settings.auto_select = true;
    settings.selection_strategy = SelectionStrategy::RoundRobin;

    let factory = TranscriberFactory::with_builder(
        Arc::new(MemorySettingsStore::new(settings)),
        mock_builder(vec![whisper.clone(), deepgram.clone()]),
    )
    .unwrap();

    for _ in 0..6 {
        factory
            .transcribe(None, b"audio", &TranscriptionOptions::default())
            .await
            .unwrap();
    }

    assert_eq!(whisper.calls(), 3);
    assert_eq!(deepgram.calls(), 3);
    let snapshot = factory.provider_metrics();
    assert_eq!(snapshot[&ProviderId::Whisper].successful_requests, 3);
    assert_eq!(snapshot[&ProviderId::Deepgram].successful_requests, 3);
}

#[tokio::test]
async fn test_quality_strategy_avoids_failing_provider() {
    let whisper = Arc::new(MockProvider::new(ProviderId::Whisper));
    let deepgram = Arc::new(MockProvider::new(ProviderId::Deepgram));
    let settings = settings_with(Some(enabled_config(None)), Some(enabled_config(None)));

    let factory = TranscriberFactory::with_builder(
        Arc::new(MemorySettingsStore::new(settings)),
        mock_builder(vec![whisper.clone(), deepgram.clone()]),
    )
    .unwrap();
    factory
        .update_config(ConfigUpdate {
            selection_strategy: Some(SelectionStrategy::QualityOptimized),
            ..Default::default()
        })
        .unwrap();

    let err = TranscriptionError::ServerTimeout("slow".into());
    factory.record_metrics(ProviderId::Whisper, false, None, None, Some(&err));
    factory.record_metrics(ProviderId::Deepgram, true, Some(800.0), Some(0.002), None);

    let response = factory
        .transcribe(
            Some(ProviderPreference::Auto),
            b"audio",
            &TranscriptionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.provider, ProviderId::Deepgram);
}

#[tokio::test]
async fn test_ab_routing_is_sticky_per_user() {
    let whisper = Arc::new(MockProvider::new(ProviderId::Whisper));
    let deepgram = Arc::new(MockProvider::new(ProviderId::Deepgram));
    let mut settings = settings_with(Some(enabled_config(None)), Some(enabled_config(None)));
    settings.ab_test.enabled = true;
    settings.ab_test.experiment_id = Some("exp-42".to_string());

    let factory = TranscriberFactory::with_builder(
        Arc::new(MemorySettingsStore::new(settings)),
        mock_builder(vec![whisper, deepgram]),
    )
    .unwrap();

    for user in ["user-1", "user-2", "user-3", "user-4", "user-5"] {
        let first = factory.get_provider_for_ab_test(user).unwrap().id();
        for _ in 0..3 {
            assert_eq!(factory.get_provider_for_ab_test(user).unwrap().id(), first);
        }
    }
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[tokio::test]
async fn test_config_changes_persist_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("providers.toml");
    let store = Arc::new(FileSettingsStore::new(&path));
    store
        .save(&settings_with(Some(enabled_config(None)), None))
        .unwrap();

    let whisper = Arc::new(MockProvider::new(ProviderId::Whisper));
    let deepgram = Arc::new(MockProvider::new(ProviderId::Deepgram));
    let factory = TranscriberFactory::with_builder(
        store.clone(),
        mock_builder(vec![whisper, deepgram.clone()]),
    )
    .unwrap();
    assert_eq!(factory.enabled_providers(), vec![ProviderId::Whisper]);

    factory
        .update_config(ConfigUpdate {
            deepgram: Some(enabled_config(None)),
            ..Default::default()
        })
        .unwrap();
    factory.set_default_provider(ProviderId::Deepgram).unwrap();
    factory.toggle_provider(ProviderId::Whisper, false).unwrap();

    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.default_provider, ProviderId::Deepgram);
    assert!(!reloaded.providers.whisper.enabled);
    assert!(reloaded.providers.deepgram.enabled);

    assert_eq!(factory.enabled_providers(), vec![ProviderId::Deepgram]);
    let response = factory
        .transcribe(None, b"audio", &TranscriptionOptions::default())
        .await
        .unwrap();
    assert_eq!(response.provider, ProviderId::Deepgram);
    assert_eq!(deepgram.calls(), 1);
}
