//! Transcription Provider Trait
//!
//! Common interface for speech-to-text backends, plus the request/response
//! shapes and the error taxonomy every backend maps into.

use crate::config::ProviderConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::DiarizationConfig;

/// Hard ceiling for a single network call, whatever the audio size
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

const BYTES_PER_MIB: usize = 1024 * 1024;

/// Identity of a transcription backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Whisper,
    Deepgram,
}

impl ProviderId {
    /// All known providers in their deterministic fallback order
    pub fn all() -> &'static [ProviderId] {
        &[Self::Whisper, Self::Deepgram]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whisper => "whisper",
            Self::Deepgram => "deepgram",
        }
    }

    /// List price in USD per audio minute, used until real cost samples exist
    pub fn default_cost_per_minute(&self) -> f64 {
        match self {
            Self::Whisper => 0.006,
            Self::Deepgram => 0.0043,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderId {
    type Err = TranscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whisper" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(TranscriptionError::NoProviderAvailable(format!(
                "unknown provider '{}'",
                other
            ))),
        }
    }
}

/// What a backend can do
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub streaming: bool,
    pub realtime: bool,
    /// ISO 639-1 codes
    pub languages: Vec<String>,
    /// Maximum accepted upload in bytes
    pub max_file_size: u64,
    pub audio_formats: Vec<String>,
    /// Feature tags such as `diarization` or `word_timestamps`
    pub features: Vec<String>,
    pub models: Vec<String>,
}

impl ProviderCapabilities {
    pub fn supports_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.languages.iter().any(|l| l.eq_ignore_ascii_case(language))
    }
}

/// Per-call transcription options
#[derive(Debug, Clone, Default)]
pub struct TranscriptionOptions {
    /// Language code (ISO 639-1); `None` lets the provider detect it
    pub language: Option<String>,
    /// Overrides the configured model for this call
    pub model: Option<String>,
    /// Request speaker diarization (ignored by providers without support)
    pub diarize: bool,
    /// Formatting applied to diarized output; defaults when absent
    pub diarization: Option<DiarizationConfig>,
    /// Extra provider-specific parameters passed through verbatim
    pub provider_options: serde_json::Map<String, serde_json::Value>,
}

/// A timed span of the transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub speaker: Option<String>,
    pub confidence: Option<f64>,
}

/// Unified result of transcription, whatever the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
    pub language: Option<String>,
    pub confidence: Option<f64>,
    /// Audio duration in seconds
    pub duration: Option<f64>,
    pub segments: Option<Vec<TranscriptionSegment>>,
    pub provider: ProviderId,
    pub metadata: Option<serde_json::Value>,
}

/// Coarse classification of a failure, stored alongside metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    RateLimit,
    QuotaExceeded,
    ProviderUnavailable,
    ServerTimeout,
    InvalidAudio,
    EmptyTranscript,
    Cancelled,
    MaxRetriesExceeded,
    NoProviderAvailable,
    Network,
    Failed,
}

/// Transcription errors
#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limited{}", .retry_after.as_ref().map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Server timeout: {0}")]
    ServerTimeout(String),

    #[error("Invalid audio: {0}")]
    InvalidAudio(String),

    #[error("Empty transcript")]
    EmptyTranscript,

    #[error("Transcription cancelled")]
    Cancelled,

    #[error("Max retries exceeded after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<TranscriptionError>,
    },

    #[error("No provider available: {0}")]
    NoProviderAvailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Transcription failed: {0}")]
    Failed(String),
}

impl TranscriptionError {
    /// Whether a retry of the same request might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ProviderUnavailable(_)
                | Self::ServerTimeout(_)
                | Self::Network(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            Self::ServerTimeout(_) => ErrorKind::ServerTimeout,
            Self::InvalidAudio(_) => ErrorKind::InvalidAudio,
            Self::EmptyTranscript => ErrorKind::EmptyTranscript,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::MaxRetriesExceeded { .. } => ErrorKind::MaxRetriesExceeded,
            Self::NoProviderAvailable(_) => ErrorKind::NoProviderAvailable,
            Self::Network(_) => ErrorKind::Network,
            Self::Failed(_) => ErrorKind::Failed,
        }
    }

    /// Innermost error, looking through retry exhaustion
    pub fn root(&self) -> &TranscriptionError {
        match self {
            Self::MaxRetriesExceeded { source, .. } => source.root(),
            other => other,
        }
    }

    /// Map a non-success HTTP status (and body) to an error
    pub fn from_status(
        status: reqwest::StatusCode,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let detail = if body.trim().is_empty() {
            status.to_string()
        } else {
            format!("{}: {}", status, body.trim())
        };
        let lower = body.to_ascii_lowercase();

        match status.as_u16() {
            401 | 403 => Self::Authentication(detail),
            402 => Self::QuotaExceeded(detail),
            429 if lower.contains("quota") => Self::QuotaExceeded(detail),
            429 => Self::RateLimited { retry_after },
            408 | 504 => Self::ServerTimeout(detail),
            400 | 413 | 415 | 422 => Self::InvalidAudio(detail),
            s if (500..600).contains(&s) => Self::ProviderUnavailable(detail),
            _ => Self::Failed(detail),
        }
    }

    /// Map a transport-level failure
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::ServerTimeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            Self::Network(err.to_string())
        } else if err.is_decode() {
            Self::Failed(format!("invalid response body: {}", err))
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Parse a `Retry-After` header given in seconds
pub fn retry_after_from_headers(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Request timeout scaled by payload size: one extra second per MiB, capped
pub fn scaled_timeout(base: Duration, audio_len: usize) -> Duration {
    let extra = Duration::from_secs((audio_len / BYTES_PER_MIB) as u64);
    (base + extra).min(MAX_REQUEST_TIMEOUT)
}

/// Reject input that no provider could handle before touching the network
pub fn validate_audio(audio: &[u8], capabilities: &ProviderCapabilities) -> Result<(), TranscriptionError> {
    if audio.is_empty() {
        return Err(TranscriptionError::InvalidAudio("Empty audio".to_string()));
    }
    if capabilities.max_file_size > 0 && audio.len() as u64 > capabilities.max_file_size {
        return Err(TranscriptionError::InvalidAudio(format!(
            "audio is {} bytes, provider accepts at most {}",
            audio.len(),
            capabilities.max_file_size
        )));
    }
    Ok(())
}

/// Trait for transcription providers
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Transcribe one whole audio buffer
    async fn transcribe(
        &self,
        audio: &[u8],
        options: &TranscriptionOptions,
    ) -> Result<TranscriptionResponse, TranscriptionError>;

    /// Check a credential against the provider without transcribing
    async fn validate_api_key(&self, api_key: &str) -> bool;

    /// Abort this provider's in-flight calls
    fn cancel(&self);

    fn id(&self) -> ProviderId;

    /// Get provider name
    fn name(&self) -> &'static str {
        self.id().as_str()
    }

    fn capabilities(&self) -> ProviderCapabilities;

    fn config(&self) -> &ProviderConfig;

    /// Check if provider is enabled and configured
    fn is_available(&self) -> bool;

    /// Get estimated cost per minute
    fn cost_per_minute(&self) -> Option<f64> {
        Some(self.id().default_cost_per_minute())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    // ============================================================
    // ProviderId Tests
    // ============================================================

    #[test]
    fn test_provider_id_roundtrip_through_str() {
        for id in ProviderId::all() {
            let parsed: ProviderId = id.as_str().parse().unwrap();
            assert_eq!(parsed, *id);
        }
        assert!("assemblyai".parse::<ProviderId>().is_err());
    }

    #[test]
    fn test_provider_id_order_is_whisper_first() {
        assert!(ProviderId::Whisper < ProviderId::Deepgram);
    }

    #[test]
    fn test_default_costs() {
        assert_eq!(ProviderId::Whisper.default_cost_per_minute(), 0.006);
        assert_eq!(ProviderId::Deepgram.default_cost_per_minute(), 0.0043);
    }

    // ============================================================
    // Retryability Tests
    // ============================================================

    #[test]
    fn test_retryable_kinds() {
        assert!(TranscriptionError::RateLimited { retry_after: None }.is_retryable());
        assert!(TranscriptionError::ProviderUnavailable("503".into()).is_retryable());
        assert!(TranscriptionError::ServerTimeout("slow".into()).is_retryable());
        assert!(TranscriptionError::Network("reset".into()).is_retryable());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(!TranscriptionError::Authentication("bad key".into()).is_retryable());
        assert!(!TranscriptionError::QuotaExceeded("done".into()).is_retryable());
        assert!(!TranscriptionError::InvalidAudio("empty".into()).is_retryable());
        assert!(!TranscriptionError::EmptyTranscript.is_retryable());
        assert!(!TranscriptionError::Cancelled.is_retryable());
        assert!(!TranscriptionError::Failed("network glitch".into()).is_retryable());
    }

    #[test]
    fn test_root_looks_through_retry_wrapper() {
        let err = TranscriptionError::MaxRetriesExceeded {
            attempts: 3,
            source: Box::new(TranscriptionError::Network("reset".into())),
        };
        assert_eq!(err.kind(), ErrorKind::MaxRetriesExceeded);
        assert_eq!(err.root().kind(), ErrorKind::Network);
        assert!(err.to_string().contains("3 attempts"));
    }

    // ============================================================
    // HTTP Classification Tests
    // ============================================================

    #[test]
    fn test_status_classification() {
        let cases = [
            (StatusCode::UNAUTHORIZED, ErrorKind::Authentication),
            (StatusCode::FORBIDDEN, ErrorKind::Authentication),
            (StatusCode::PAYMENT_REQUIRED, ErrorKind::QuotaExceeded),
            (StatusCode::TOO_MANY_REQUESTS, ErrorKind::RateLimit),
            (StatusCode::GATEWAY_TIMEOUT, ErrorKind::ServerTimeout),
            (StatusCode::PAYLOAD_TOO_LARGE, ErrorKind::InvalidAudio),
            (StatusCode::SERVICE_UNAVAILABLE, ErrorKind::ProviderUnavailable),
            (StatusCode::NOT_FOUND, ErrorKind::Failed),
        ];
        for (status, kind) in cases {
            assert_eq!(TranscriptionError::from_status(status, "", None).kind(), kind, "{}", status);
        }
    }

    #[test]
    fn test_quota_message_on_429() {
        let err = TranscriptionError::from_status(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"code":"insufficient_quota"}}"#,
            None,
        );
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after_from_headers(&headers), Some(Duration::from_secs(7)));

        headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(retry_after_from_headers(&headers), None);
    }

    // ============================================================
    // Timeout and Validation Tests
    // ============================================================

    #[test]
    fn test_scaled_timeout() {
        let base = Duration::from_secs(30);
        assert_eq!(scaled_timeout(base, 1000), base);
        assert_eq!(scaled_timeout(base, 5 * BYTES_PER_MIB), Duration::from_secs(35));
        assert_eq!(scaled_timeout(base, 2000 * BYTES_PER_MIB), MAX_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_validate_audio() {
        let caps = ProviderCapabilities {
            max_file_size: 10,
            ..Default::default()
        };
        assert!(validate_audio(&[], &caps).is_err());
        assert!(validate_audio(&[0; 11], &caps).is_err());
        assert!(validate_audio(&[0; 10], &caps).is_ok());
    }
}
