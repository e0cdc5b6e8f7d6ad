// Transcription
//
// The transcribe phase turns a local media file into timed segments.
// `Transcriber` is the seam the orchestrator calls; `WhisperCppTranscriber`
// shells out to whisper.cpp.
//
// To add a new transcription service, implement `Transcriber` and add a
// variant to `TranscriberImplementation`.

pub mod whisper_cpp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::{MediaConfig, TranscriberConfig};
use crate::error::Result;

/// One timed piece of recognised speech
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Seconds from the start of the media
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// 0.0-1.0
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    /// Language reported by the recogniser
    pub language_detected: String,
    /// Mean segment confidence
    pub confidence: f32,
}

impl TranscriptionResult {
    pub fn from_segments(segments: Vec<TranscriptSegment>, language_detected: String) -> Self {
        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let confidence = mean_confidence(segments.iter().map(|s| s.confidence));
        Self {
            text,
            segments,
            language_detected,
            confidence,
        }
    }
}

pub(crate) fn mean_confidence(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = values.fold((0.0f32, 0usize), |(sum, n), v| (sum + v, n + 1));
    if count == 0 { 0.0 } else { sum / count as f32 }
}

/// Main trait for transcription operations
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a local media file. `language_hint` skips detection.
    async fn transcribe(&self, media_path: PathBuf, language_hint: Option<String>) -> Result<TranscriptionResult>;
}

/// Transcriber implementation type
#[derive(Debug, Clone)]
pub enum TranscriberImplementation {
    WhisperCpp,
}

/// Factory for creating transcriber instances
pub struct TranscriberFactory;

impl TranscriberFactory {
    pub fn create_transcriber(
        implementation: TranscriberImplementation,
        config: TranscriberConfig,
        media: MediaConfig,
    ) -> Box<dyn Transcriber> {
        match implementation {
            TranscriberImplementation::WhisperCpp => {
                Box::new(whisper_cpp::WhisperCppTranscriber::new(config, media))
            }
        }
    }

    pub fn create_default(config: TranscriberConfig, media: MediaConfig) -> Box<dyn Transcriber> {
        Self::create_transcriber(TranscriberImplementation::WhisperCpp, config, media)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(text: &str, confidence: f32) -> TranscriptSegment {
        TranscriptSegment {
            start: 0.0,
            end: 1.0,
            text: text.to_string(),
            confidence,
        }
    }

    #[test]
    fn test_from_segments_joins_text_and_averages() {
        let result = TranscriptionResult::from_segments(
            vec![segment("Hello", 0.9), segment("world", 0.7)],
            "en".to_string(),
        );
        assert_eq!(result.text, "Hello world");
        assert!((result.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_empty_confidence_is_zero() {
        assert_eq!(mean_confidence(std::iter::empty()), 0.0);
    }
}
