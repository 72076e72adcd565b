//! Speaker Diarization Formatting
//!
//! Turns word-level speaker tags into merged, labeled segments and readable
//! text. Words without any speaker tag fall back to a single unlabeled
//! segment so undiarized responses still render.

use super::TranscriptionSegment;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Words per segment in the undiarized fallback rendering
pub const NAIVE_SEGMENT_WORDS: usize = 10;

/// One recognized word with timing and optional speaker tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiarizedWord {
    pub word: String,
    /// Seconds
    pub start: f64,
    /// Seconds
    pub end: f64,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub speaker: Option<u32>,
}

impl DiarizedWord {
    pub fn new(word: impl Into<String>, start: f64, end: f64, confidence: f64) -> Self {
        Self {
            word: word.into(),
            start,
            end,
            confidence,
            speaker: None,
        }
    }

    pub fn with_speaker(mut self, speaker: u32) -> Self {
        self.speaker = Some(speaker);
        self
    }
}

/// A run of consecutive words from one speaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiarizedSegment {
    /// 0-based, in output order
    pub id: usize,
    pub text: String,
    pub speaker: u32,
    pub start: f64,
    pub end: f64,
    /// Mean of the word confidences
    pub confidence: f64,
    pub word_count: usize,
}

/// How each segment is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiarizationFormat {
    /// `Speaker 1: text`
    #[default]
    SpeakerPrefix,
    /// Label on its own line above the text
    SpeakerBlock,
    /// Rendered like `SpeakerPrefix` for now
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelScheme {
    /// Speaker 1, Speaker 2, ...
    #[default]
    Numeric,
    /// Speaker A, Speaker B, ... wrapping after Z
    Alphabetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerLabels {
    pub prefix: String,
    pub scheme: LabelScheme,
    /// Explicit names indexed by speaker id; override the scheme when present
    pub custom_labels: Vec<String>,
}

impl Default for SpeakerLabels {
    fn default() -> Self {
        Self {
            prefix: "Speaker".to_string(),
            scheme: LabelScheme::Numeric,
            custom_labels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergingPolicy {
    /// Pause in seconds above which a speaker's turn is split
    pub consecutive_threshold: f64,
    /// Segments with fewer words are dropped
    pub min_segment_length: usize,
}

impl Default for MergingPolicy {
    fn default() -> Self {
        Self {
            consecutive_threshold: 0.5,
            min_segment_length: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Prefix each segment with `[mm:ss - mm:ss]`
    pub include_timestamps: bool,
    /// Suffix each segment with `(NN%)`
    pub include_confidence: bool,
    /// One segment per line; otherwise segments run together
    pub paragraph_breaks: bool,
    /// Blank line whenever the speaker changes
    pub line_breaks_between_speakers: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            include_timestamps: false,
            include_confidence: false,
            paragraph_breaks: true,
            line_breaks_between_speakers: false,
        }
    }
}

/// Diarization rendering configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiarizationConfig {
    pub format: DiarizationFormat,
    pub labels: SpeakerLabels,
    pub merging: MergingPolicy,
    pub output: OutputOptions,
}

impl DiarizationConfig {
    pub fn validate(&self) -> Result<(), DiarizationError> {
        let threshold = self.merging.consecutive_threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(DiarizationError::InvalidConfig(format!(
                "consecutive_threshold must be a non-negative number, got {}",
                threshold
            )));
        }
        if self.merging.min_segment_length == 0 {
            return Err(DiarizationError::InvalidConfig(
                "min_segment_length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiarizationStatistics {
    pub speaker_segment_counts: BTreeMap<u32, usize>,
    /// Words per segment
    pub average_segment_length: f64,
    /// Seconds from the first word's start to the last word's end
    pub total_duration: f64,
    pub average_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiarizationResult {
    pub formatted_text: String,
    pub segments: Vec<DiarizedSegment>,
    pub speaker_count: usize,
    pub statistics: DiarizationStatistics,
    pub original_word_count: usize,
    /// False when no word carried a speaker tag
    pub diarized: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DiarizationError {
    #[error("Invalid diarization config: {0}")]
    InvalidConfig(String),
}

/// Label for a speaker id under the given labeling rules
pub fn speaker_label(speaker: u32, labels: &SpeakerLabels) -> String {
    if let Some(custom) = labels
        .custom_labels
        .get(speaker as usize)
        .filter(|l| !l.trim().is_empty())
    {
        return custom.clone();
    }

    let tag = match labels.scheme {
        LabelScheme::Numeric => (u64::from(speaker) + 1).to_string(),
        LabelScheme::Alphabetic => char::from(b'A' + (speaker % 26) as u8).to_string(),
    };

    if labels.prefix.is_empty() {
        tag
    } else {
        format!("{} {}", labels.prefix, tag)
    }
}

/// Seconds as `mm:ss`
fn format_timestamp(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Segment words by speaker and pause length, then render them
pub fn format_transcript(
    words: &[DiarizedWord],
    config: &DiarizationConfig,
) -> Result<DiarizationResult, DiarizationError> {
    config.validate()?;

    if !words.iter().any(|w| w.speaker.is_some()) {
        return Ok(undiarized(words));
    }

    let segments = segment_words(words, &config.merging);
    let speaker_count = words
        .iter()
        .filter_map(|w| w.speaker)
        .collect::<BTreeSet<_>>()
        .len();

    Ok(DiarizationResult {
        formatted_text: render(&segments, config),
        statistics: statistics(&segments, words),
        segments,
        speaker_count,
        original_word_count: words.len(),
        diarized: true,
    })
}

fn undiarized(words: &[DiarizedWord]) -> DiarizationResult {
    let text = words
        .iter()
        .map(|w| w.word.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let segment = DiarizedSegment {
        id: 0,
        text: text.clone(),
        speaker: 0,
        start: words.first().map(|w| w.start).unwrap_or(0.0),
        end: words.last().map(|w| w.end).unwrap_or(0.0),
        confidence: mean(words.iter().map(|w| w.confidence)),
        word_count: words.len(),
    };
    let segments = vec![segment];

    DiarizationResult {
        formatted_text: text,
        statistics: statistics(&segments, words),
        segments,
        speaker_count: 1,
        original_word_count: words.len(),
        diarized: false,
    }
}

fn segment_words(words: &[DiarizedWord], policy: &MergingPolicy) -> Vec<DiarizedSegment> {
    let mut finished: Vec<DiarizedSegment> = Vec::new();
    let mut open: Option<DiarizedSegment> = None;
    let mut previous_end: Option<f64> = None;

    for word in words {
        let current_speaker = open.as_ref().map(|s| s.speaker);
        // Untagged words stay with the current turn
        let speaker = word.speaker.or(current_speaker).unwrap_or(0);

        let starts_new = match (&open, previous_end) {
            (Some(segment), Some(prev_end)) => {
                segment.speaker != speaker
                    || word.start - prev_end > policy.consecutive_threshold
            }
            _ => true,
        };

        if starts_new {
            if let Some(done) = open.take() {
                finished.push(done);
            }
            open = Some(DiarizedSegment {
                id: 0,
                text: word.word.clone(),
                speaker,
                start: word.start,
                end: word.end,
                confidence: word.confidence,
                word_count: 1,
            });
        } else if let Some(segment) = open.as_mut() {
            segment.text.push(' ');
            segment.text.push_str(&word.word);
            segment.end = word.end;
            segment.word_count += 1;
            let n = segment.word_count as f64;
            segment.confidence = (segment.confidence * (n - 1.0) + word.confidence) / n;
        }

        previous_end = Some(word.end);
    }
    if let Some(done) = open {
        finished.push(done);
    }

    finished
        .into_iter()
        .filter(|s| s.word_count >= policy.min_segment_length && !s.text.trim().is_empty())
        .enumerate()
        .map(|(id, segment)| DiarizedSegment { id, ..segment })
        .collect()
}

fn render_segment(segment: &DiarizedSegment, config: &DiarizationConfig) -> String {
    let label = speaker_label(segment.speaker, &config.labels);
    let mut line = String::new();

    if config.output.include_timestamps {
        line.push_str(&format!(
            "[{} - {}] ",
            format_timestamp(segment.start),
            format_timestamp(segment.end)
        ));
    }

    match config.format {
        DiarizationFormat::SpeakerPrefix | DiarizationFormat::Custom => {
            line.push_str(&format!("{}: {}", label, segment.text));
        }
        DiarizationFormat::SpeakerBlock => {
            line.push_str(&format!("{}\n{}", label, segment.text));
        }
    }

    if config.output.include_confidence {
        line.push_str(&format!(" ({:.0}%)", segment.confidence * 100.0));
    }
    line
}

fn render(segments: &[DiarizedSegment], config: &DiarizationConfig) -> String {
    let separator = if config.output.paragraph_breaks { "\n" } else { " " };
    let mut out = String::new();
    let mut last_speaker: Option<u32> = None;

    for segment in segments {
        if let Some(previous) = last_speaker {
            out.push_str(separator);
            if config.output.line_breaks_between_speakers && previous != segment.speaker {
                out.push('\n');
            }
        }
        out.push_str(&render_segment(segment, config));
        last_speaker = Some(segment.speaker);
    }
    out
}

fn statistics(segments: &[DiarizedSegment], words: &[DiarizedWord]) -> DiarizationStatistics {
    let mut speaker_segment_counts = BTreeMap::new();
    for segment in segments {
        *speaker_segment_counts.entry(segment.speaker).or_insert(0) += 1;
    }

    let total_words: usize = segments.iter().map(|s| s.word_count).sum();
    let average_segment_length = if segments.is_empty() {
        0.0
    } else {
        total_words as f64 / segments.len() as f64
    };

    let total_duration = match (words.first(), words.last()) {
        (Some(first), Some(last)) => last.end - first.start,
        _ => 0.0,
    };

    DiarizationStatistics {
        speaker_segment_counts,
        average_segment_length,
        total_duration,
        average_confidence: mean(segments.iter().map(|s| s.confidence)),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Map diarized segments to the provider-neutral shape
pub fn to_transcription_segments(segments: &[DiarizedSegment]) -> Vec<TranscriptionSegment> {
    segments
        .iter()
        .map(|s| TranscriptionSegment {
            text: s.text.clone(),
            start: s.start,
            end: s.end,
            speaker: Some(s.speaker.to_string()),
            confidence: Some(s.confidence),
        })
        .collect()
}

/// Fixed-size word chunks, used when diarized rendering is not possible
pub fn naive_segments(words: &[DiarizedWord], chunk_size: usize) -> Vec<TranscriptionSegment> {
    words
        .chunks(chunk_size.max(1))
        .map(|chunk| TranscriptionSegment {
            text: chunk
                .iter()
                .map(|w| w.word.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            start: chunk.first().map(|w| w.start).unwrap_or(0.0),
            end: chunk.last().map(|w| w.end).unwrap_or(0.0),
            speaker: None,
            confidence: Some(mean(chunk.iter().map(|w| w.confidence))),
        })
        .collect()
}
