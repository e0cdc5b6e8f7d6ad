use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::MediaConfig;
use crate::error::{Result, SubflowError};
use super::{rendered_path, MediaCommandBuilder, RenderResult, Renderer};

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// FFmpeg-backed renderer
pub struct FfmpegRenderer {
    config: MediaConfig,
    ffmpeg: MediaCommandBuilder,
    ffprobe: MediaCommandBuilder,
}

impl FfmpegRenderer {
    pub fn new(config: MediaConfig) -> Self {
        let ffmpeg = MediaCommandBuilder::new(&config.binary_path);
        let ffprobe = MediaCommandBuilder::new(&config.probe_path);
        Self { config, ffmpeg, ffprobe }
    }

    /// Extract whisper-ready audio from a video file
    pub async fn extract_audio(&self, video_path: &Path, audio_path: &Path) -> Result<()> {
        info!("Extracting audio from {} to {}", video_path.display(), audio_path.display());
        self.ffmpeg.extract_audio(video_path, audio_path).execute().await
    }

    /// Duration and resolution of `path`. Probe failures are not fatal to a render.
    async fn probe(&self, path: &Path) -> (Option<f64>, Option<String>) {
        match self.ffprobe.probe(path).capture().await {
            Ok(stdout) => parse_probe(&stdout),
            Err(e) => {
                warn!("Could not probe {}: {}", path.display(), e);
                (None, None)
            }
        }
    }
}

fn parse_probe(stdout: &str) -> (Option<f64>, Option<String>) {
    let Ok(probe) = serde_json::from_str::<ProbeOutput>(stdout) else {
        return (None, None);
    };
    let duration = probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok());
    let resolution = probe
        .streams
        .first()
        .and_then(|s| Some(format!("{}x{}", s.width?, s.height?)));
    (duration, resolution)
}

#[async_trait]
impl Renderer for FfmpegRenderer {
    async fn render(&self, source: PathBuf, caption_track: PathBuf) -> Result<RenderResult> {
        if !source.exists() {
            return Err(SubflowError::Validation(format!("Source not found: {}", source.display())));
        }
        let output_ref = rendered_path(&source, &caption_track);
        info!(
            "Embedding subtitles from {} into {} -> {}",
            caption_track.display(),
            source.display(),
            output_ref.display()
        );

        self.ffmpeg
            .embed_subtitles(source.as_path(), caption_track.as_path(), output_ref.as_path(), &self.config.subtitle_options)
            .execute()
            .await?;

        let (duration_secs, resolution) = self.probe(&output_ref).await;
        info!("Rendered {} ({:?}s, {:?})", output_ref.display(), duration_secs, resolution);

        Ok(RenderResult {
            output_ref,
            duration_secs,
            resolution,
        })
    }
}
