//! Deepgram Provider
//!
//! Prerecorded transcription through Deepgram's `/v1/listen` endpoint, with
//! optional speaker diarization rendered by the diarization formatter.

use super::http::{option_value_to_string, send_json};
use super::{
    format_transcript, naive_segments, scaled_timeout, to_transcription_segments,
    validate_audio, DiarizationConfig, DiarizedWord, InFlightCalls, ProviderCapabilities,
    ProviderId, TranscriptionError, TranscriptionOptions, TranscriptionProvider,
    TranscriptionResponse, NAIVE_SEGMENT_WORDS,
};
use crate::config::ProviderConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;

const DEEPGRAM_API_URL: &str = "https://api.deepgram.com";
const DEFAULT_MODEL: &str = "nova-2";
const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_MIME_TYPE: &str = "audio/wav";

/// Deepgram transcription provider
pub struct DeepgramProvider {
    config: ProviderConfig,
    base_url: String,
    client: reqwest::Client,
    in_flight: InFlightCalls,
}

impl DeepgramProvider {
    /// Create a provider from its settings; fails without a credential
    pub fn new(config: ProviderConfig) -> Result<Self, TranscriptionError> {
        if !config.has_api_key() {
            return Err(TranscriptionError::Authentication(
                "API key not configured for deepgram".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TranscriptionError::Failed(format!("HTTP client: {}", e)))?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEEPGRAM_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            config,
            base_url,
            client,
            in_flight: InFlightCalls::new(),
        })
    }

    fn auth_header(key: &str) -> String {
        format!("Token {}", key.trim())
    }

    fn model<'a>(&'a self, options: &'a TranscriptionOptions) -> &'a str {
        options
            .model
            .as_deref()
            .filter(|m| !m.is_empty())
            .or_else(|| Some(self.config.model.as_str()).filter(|m| !m.is_empty()))
            .unwrap_or(DEFAULT_MODEL)
    }

    fn query(&self, options: &TranscriptionOptions) -> Vec<(String, String)> {
        let mut query = vec![
            ("model".to_string(), self.model(options).to_string()),
            ("smart_format".to_string(), "true".to_string()),
            ("punctuate".to_string(), "true".to_string()),
        ];

        if options.diarize {
            query.push(("diarize".to_string(), "true".to_string()));
        }

        match options.language.as_deref().filter(|l| *l != "auto") {
            Some(language) => query.push(("language".to_string(), language.to_string())),
            None => query.push(("detect_language".to_string(), "true".to_string())),
        }

        for (key, value) in &options.provider_options {
            if matches!(key.as_str(), "mime_type" | "file_name" | "model") {
                continue;
            }
            if let Some(value) = option_value_to_string(value) {
                query.retain(|(k, _)| k != key);
                query.push((key.clone(), value));
            }
        }

        query
    }

    /// Turn a Deepgram response into the unified shape
    fn build_response(
        &self,
        body: DeepgramResponse,
        options: &TranscriptionOptions,
        model: &str,
        processing_ms: u64,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        let channel = body.results.channels.into_iter().next();
        let detected_language = channel.as_ref().and_then(|c| c.detected_language.clone());
        let alternative = channel
            .and_then(|c| c.alternatives.into_iter().next())
            .ok_or(TranscriptionError::EmptyTranscript)?;

        let transcript = alternative.transcript.trim().to_string();
        if transcript.is_empty() {
            return Err(TranscriptionError::EmptyTranscript);
        }

        let words: Vec<DiarizedWord> = alternative
            .words
            .into_iter()
            .map(|w| {
                let text = w.punctuated_word.unwrap_or(w.word);
                let word = DiarizedWord::new(text, w.start, w.end, w.confidence);
                match w.speaker {
                    Some(speaker) => word.with_speaker(speaker),
                    None => word,
                }
            })
            .collect();

        let mut metadata = serde_json::json!({
            "model": model,
            "processing_ms": processing_ms,
            "request_id": body.metadata.request_id,
        });

        let has_speakers = words.iter().any(|w| w.speaker.is_some());
        let (text, segments) = if has_speakers {
            let config = options.diarization.clone().unwrap_or_default();
            self.diarize(&transcript, &words, &config, &mut metadata)
        } else {
            let segments = naive_segments(&words, NAIVE_SEGMENT_WORDS);
            (transcript, segments)
        };

        Ok(TranscriptionResponse {
            text,
            language: detected_language.or_else(|| options.language.clone()),
            confidence: Some(alternative.confidence),
            duration: body.metadata.duration,
            segments: if segments.is_empty() { None } else { Some(segments) },
            provider: ProviderId::Deepgram,
            metadata: Some(metadata),
        })
    }

    fn diarize(
        &self,
        transcript: &str,
        words: &[DiarizedWord],
        config: &DiarizationConfig,
        metadata: &mut serde_json::Value,
    ) -> (String, Vec<super::TranscriptionSegment>) {
        match format_transcript(words, config) {
            Ok(result) => {
                metadata["diarization"] = serde_json::json!({
                    "speaker_count": result.speaker_count,
                    "segment_count": result.segments.len(),
                    "statistics": result.statistics,
                });
                let segments = to_transcription_segments(&result.segments);
                (result.formatted_text, segments)
            }
            Err(e) => {
                tracing::warn!("Diarization formatting failed, using plain transcript: {}", e);
                metadata["diarization_error"] = serde_json::Value::String(e.to_string());
                (
                    transcript.to_string(),
                    naive_segments(words, NAIVE_SEGMENT_WORDS),
                )
            }
        }
    }
}

#[async_trait]
impl TranscriptionProvider for DeepgramProvider {
    async fn transcribe(
        &self,
        audio: &[u8],
        options: &TranscriptionOptions,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        validate_audio(audio, &self.capabilities())?;
        let start = Instant::now();

        let mime_type = options
            .provider_options
            .get("mime_type")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();

        let call = self.in_flight.register();
        let request = self
            .client
            .post(format!("{}/v1/listen", self.base_url))
            .header(
                reqwest::header::AUTHORIZATION,
                Self::auth_header(self.config.api_key.as_deref().unwrap_or_default()),
            )
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .query(&self.query(options))
            .timeout(scaled_timeout(self.config.timeout(), audio.len()))
            .body(audio.to_vec());

        let body: DeepgramResponse = send_json(request, call.token()).await?;
        let processing_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(
            "Deepgram transcribed {} bytes in {}ms",
            audio.len(),
            processing_ms
        );

        self.build_response(body, options, self.model(options), processing_ms)
    }

    async fn validate_api_key(&self, api_key: &str) -> bool {
        if api_key.trim().is_empty() {
            return false;
        }
        match self
            .client
            .get(format!("{}/v1/projects", self.base_url))
            .header(reqwest::header::AUTHORIZATION, Self::auth_header(api_key))
            .timeout(self.config.timeout())
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!("Deepgram key validation failed: {}", e);
                false
            }
        }
    }

    fn cancel(&self) {
        let cancelled = self.in_flight.cancel_all();
        if cancelled > 0 {
            tracing::info!("Cancelled {} in-flight deepgram request(s)", cancelled);
        }
    }

    fn id(&self) -> ProviderId {
        ProviderId::Deepgram
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            streaming: true,
            realtime: true,
            languages: [
                "en", "es", "fr", "de", "it", "pt", "nl", "ru", "zh", "ja", "ko", "hi", "pl",
                "tr", "uk", "sv", "da", "no",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_file_size: MAX_FILE_SIZE,
            audio_formats: ["wav", "mp3", "flac", "ogg", "opus", "m4a", "webm", "aac"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            features: [
                "diarization",
                "language_detection",
                "smart_format",
                "punctuation",
                "word_timestamps",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            models: ["nova-2", "nova", "enhanced", "base"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn is_available(&self) -> bool {
        self.config.enabled && self.config.has_api_key()
    }
}

#[derive(Debug, Deserialize)]
struct DeepgramResponse {
    #[serde(default)]
    metadata: DeepgramMetadata,
    results: DeepgramResults,
}

#[derive(Debug, Default, Deserialize)]
struct DeepgramMetadata {
    request_id: Option<String>,
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DeepgramResults {
    #[serde(default)]
    channels: Vec<DeepgramChannel>,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    detected_language: Option<String>,
    #[serde(default)]
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    words: Vec<DeepgramWord>,
}

#[derive(Debug, Deserialize)]
struct DeepgramWord {
    word: String,
    start: f64,
    end: f64,
    #[serde(default)]
    confidence: f64,
    speaker: Option<u32>,
    punctuated_word: Option<String>,
}
