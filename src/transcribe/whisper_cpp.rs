use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{MediaConfig, TranscriberConfig};
use crate::error::{Result, SubflowError};
use crate::media::MediaCommandBuilder;
use super::{mean_confidence, TranscriptSegment, Transcriber, TranscriptionResult};

/// whisper.cpp `-ojf` (full JSON) output
#[derive(Debug, Clone, Deserialize)]
pub struct WhisperCppOutput {
    #[serde(default)]
    pub result: Option<WhisperCppResult>,
    #[serde(default)]
    pub transcription: Vec<WhisperCppSegment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperCppResult {
    pub language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperCppSegment {
    pub offsets: WhisperCppOffsets,
    pub text: String,
    #[serde(default)]
    pub tokens: Vec<WhisperCppToken>,
}

/// Milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct WhisperCppOffsets {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperCppToken {
    pub text: String,
    #[serde(default)]
    pub p: f32,
}

impl WhisperCppOutput {
    /// Convert to the pipeline's transcript shape. Special tokens such as
    /// `[_BEG_]` do not count towards confidence.
    pub fn into_result(self) -> TranscriptionResult {
        let language = self
            .result
            .and_then(|r| r.language)
            .unwrap_or_else(|| "unknown".to_string());

        let segments = self
            .transcription
            .into_iter()
            .filter(|seg| !seg.text.trim().is_empty())
            .map(|seg| TranscriptSegment {
                start: seg.offsets.from as f64 / 1000.0,
                end: seg.offsets.to as f64 / 1000.0,
                text: seg.text.trim().to_string(),
                confidence: mean_confidence(
                    seg.tokens
                        .iter()
                        .filter(|t| !(t.text.starts_with("[_") && t.text.ends_with(']')))
                        .map(|t| t.p.clamp(0.0, 1.0)),
                ),
            })
            .collect();

        TranscriptionResult::from_segments(segments, language)
    }
}

/// whisper.cpp CLI implementation
pub struct WhisperCppTranscriber {
    config: TranscriberConfig,
    ffmpeg: MediaCommandBuilder,
}

impl WhisperCppTranscriber {
    pub fn new(config: TranscriberConfig, media: MediaConfig) -> Self {
        Self {
            config,
            ffmpeg: MediaCommandBuilder::new(media.binary_path),
        }
    }

    async fn run_whisper(&self, audio_path: &Path, output_base: &Path, language: &str) -> Result<()> {
        let mut cmd = Command::new(&self.config.binary_path);
        cmd.arg("-m")
            .arg(&self.config.model_path)
            .arg("-f")
            .arg(audio_path)
            .arg("-t")
            .arg(self.config.threads.to_string())
            .arg("-l")
            .arg(language)
            .arg("-ojf")
            .arg("-of")
            .arg(output_base)
            .kill_on_drop(true);

        debug!("Running whisper.cpp: {:?}", cmd);
        let output = cmd
            .output()
            .await
            .map_err(|e| SubflowError::Transcription(format!("Failed to execute {}: {}", self.config.binary_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SubflowError::Transcription(format!("whisper.cpp failed: {}", stderr.trim())));
        }
        Ok(())
    }
}

#[async_trait]
impl Transcriber for WhisperCppTranscriber {
    async fn transcribe(&self, media_path: PathBuf, language_hint: Option<String>) -> Result<TranscriptionResult> {
        if !self.config.model_path.exists() {
            return Err(SubflowError::Config(format!(
                "Whisper model not found: {}",
                self.config.model_path.display()
            )));
        }

        info!("Transcribing {}", media_path.display());
        let temp_dir = tempfile::tempdir()
            .map_err(|e| SubflowError::Transcription(format!("Failed to create temp directory: {}", e)))?;
        let audio_path = temp_dir.path().join("audio.wav");
        let output_base = temp_dir.path().join("transcript");

        self.ffmpeg
            .extract_audio(media_path.as_path(), audio_path.as_path())
            .execute()
            .await?;

        let language = language_hint.unwrap_or_else(|| self.config.default_language.clone());
        self.run_whisper(&audio_path, &output_base, &language).await?;

        let json_file = output_base.with_extension("json");
        let json_content = tokio::fs::read_to_string(&json_file)
            .await
            .map_err(|e| SubflowError::Transcription(format!("Failed to read whisper output: {}", e)))?;
        let output: WhisperCppOutput = serde_json::from_str(&json_content)
            .map_err(|e| SubflowError::Transcription(format!("Failed to parse whisper.cpp JSON: {}", e)))?;

        let result = output.into_result();
        info!(
            "Transcribed {} segments ({}), confidence {:.2}",
            result.segments.len(),
            result.language_detected,
            result.confidence
        );
        Ok(result)
    }
}
