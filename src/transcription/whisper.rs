//! Whisper API Provider
//!
//! Cloud transcription through an OpenAI-compatible `/audio/transcriptions`
//! endpoint.

use super::http::{option_value_to_string, send_json};
use super::{
    scaled_timeout, validate_audio, InFlightCalls, ProviderCapabilities, ProviderId,
    TranscriptionError, TranscriptionOptions, TranscriptionProvider, TranscriptionResponse,
    TranscriptionSegment,
};
use crate::config::ProviderConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;

const WHISPER_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "whisper-1";
const MAX_FILE_SIZE: u64 = 25 * 1024 * 1024;
const DEFAULT_FILE_NAME: &str = "audio.wav";
const DEFAULT_MIME_TYPE: &str = "audio/wav";

/// Whisper API transcription provider
pub struct WhisperProvider {
    config: ProviderConfig,
    base_url: String,
    client: reqwest::Client,
    in_flight: InFlightCalls,
}

impl WhisperProvider {
    /// Create a provider from its settings; fails without a credential
    pub fn new(config: ProviderConfig) -> Result<Self, TranscriptionError> {
        if !config.has_api_key() {
            return Err(TranscriptionError::Authentication(
                "API key not configured for whisper".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TranscriptionError::Failed(format!("HTTP client: {}", e)))?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| WHISPER_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            config,
            base_url,
            client,
            in_flight: InFlightCalls::new(),
        })
    }

    fn api_key(&self) -> &str {
        self.config.api_key.as_deref().unwrap_or_default()
    }

    fn model<'a>(&'a self, options: &'a TranscriptionOptions) -> &'a str {
        options
            .model
            .as_deref()
            .filter(|m| !m.is_empty())
            .or_else(|| Some(self.config.model.as_str()).filter(|m| !m.is_empty()))
            .unwrap_or(DEFAULT_MODEL)
    }

    fn build_form(
        &self,
        audio: &[u8],
        options: &TranscriptionOptions,
    ) -> Result<reqwest::multipart::Form, TranscriptionError> {
        let extra = &options.provider_options;
        let file_name = extra
            .get("file_name")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_FILE_NAME)
            .to_string();
        let mime_type = extra
            .get("mime_type")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_MIME_TYPE);

        let file_part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(file_name)
            .mime_str(mime_type)
            .map_err(|e| TranscriptionError::InvalidAudio(e.to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.model(options).to_string())
            .text("response_format", "verbose_json");

        if let Some(language) = options.language.as_deref().filter(|l| *l != "auto") {
            form = form.text("language", language.to_string());
        }

        for (key, value) in extra {
            if matches!(key.as_str(), "file_name" | "mime_type" | "model" | "response_format") {
                continue;
            }
            if let Some(value) = option_value_to_string(value) {
                form = form.text(key.clone(), value);
            }
        }

        Ok(form)
    }
}

#[async_trait]
impl TranscriptionProvider for WhisperProvider {
    async fn transcribe(
        &self,
        audio: &[u8],
        options: &TranscriptionOptions,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        validate_audio(audio, &self.capabilities())?;
        let form = self.build_form(audio, options)?;
        let start = Instant::now();

        let call = self.in_flight.register();
        let request = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key())
            .timeout(scaled_timeout(self.config.timeout(), audio.len()))
            .multipart(form);

        let body: WhisperResponse = send_json(request, call.token()).await?;

        let text = body.text.trim().to_string();
        if text.is_empty() {
            return Err(TranscriptionError::EmptyTranscript);
        }

        let segments: Vec<TranscriptionSegment> = body
            .segments
            .unwrap_or_default()
            .into_iter()
            .map(|s| TranscriptionSegment {
                text: s.text.trim().to_string(),
                start: s.start,
                end: s.end,
                speaker: None,
                confidence: s.avg_logprob.map(|lp| lp.exp().clamp(0.0, 1.0)),
            })
            .collect();

        let confidences: Vec<f64> = segments.iter().filter_map(|s| s.confidence).collect();
        let confidence = if confidences.is_empty() {
            None
        } else {
            Some(confidences.iter().sum::<f64>() / confidences.len() as f64)
        };

        tracing::debug!(
            "Whisper transcribed {} bytes in {}ms",
            audio.len(),
            start.elapsed().as_millis()
        );

        Ok(TranscriptionResponse {
            text,
            language: body.language,
            confidence,
            duration: body.duration,
            segments: if segments.is_empty() { None } else { Some(segments) },
            provider: ProviderId::Whisper,
            metadata: Some(serde_json::json!({
                "model": self.model(options),
                "processing_ms": start.elapsed().as_millis() as u64,
            })),
        })
    }

    async fn validate_api_key(&self, api_key: &str) -> bool {
        if api_key.trim().is_empty() {
            return false;
        }
        match self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(api_key.trim())
            .timeout(self.config.timeout())
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!("Whisper key validation failed: {}", e);
                false
            }
        }
    }

    fn cancel(&self) {
        let cancelled = self.in_flight.cancel_all();
        if cancelled > 0 {
            tracing::info!("Cancelled {} in-flight whisper request(s)", cancelled);
        }
    }

    fn id(&self) -> ProviderId {
        ProviderId::Whisper
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            streaming: false,
            realtime: false,
            languages: [
                "en", "es", "fr", "de", "it", "pt", "nl", "ru", "zh", "ja", "ko", "ar", "hi",
                "pl", "tr", "uk", "sv",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_file_size: MAX_FILE_SIZE,
            audio_formats: ["flac", "mp3", "mp4", "mpeg", "mpga", "m4a", "ogg", "wav", "webm"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            features: ["language_detection", "segment_timestamps", "translation"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            models: vec![DEFAULT_MODEL.to_string()],
        }
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn is_available(&self) -> bool {
        self.config.enabled && self.config.has_api_key()
    }
}

/// Whisper API verbose_json response
#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
    language: Option<String>,
    duration: Option<f64>,
    segments: Option<Vec<WhisperSegment>>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
    avg_logprob: Option<f64>,
}
