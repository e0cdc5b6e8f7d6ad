// Media rendering
//
// The render phase burns a caption track into the source video. The
// `Renderer` trait is the seam the orchestrator calls; `FfmpegRenderer` is
// the production implementation built on the command builders in
// `commands`.

pub mod commands;
pub mod processor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use commands::*;
pub use processor::*;

use crate::config::MediaConfig;
use crate::error::Result;

/// Artifact produced by the render phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderResult {
    pub output_ref: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// "WIDTHxHEIGHT" of the first video stream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

/// Main trait for the render phase
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Burn `caption_track` into `source`, writing a new artifact
    async fn render(&self, source: PathBuf, caption_track: PathBuf) -> Result<RenderResult>;
}

/// Factory for creating renderer instances
pub struct RendererFactory;

impl RendererFactory {
    /// Create the default renderer implementation (FFmpeg-based)
    pub fn create_renderer(config: MediaConfig) -> Box<dyn Renderer> {
        Box::new(processor::FfmpegRenderer::new(config))
    }
}

/// Output path for a rendered artifact: `<stem>.<lang>.<ext>` next to the caption track.
pub fn rendered_path(source: &Path, caption_track: &Path) -> PathBuf {
    let caption_stem = caption_track
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let extension = source
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp4".to_string());
    caption_track.with_file_name(format!("{}.{}", caption_stem, extension))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_path_uses_caption_stem() {
        let out = rendered_path(Path::new("/in/clip.mkv"), Path::new("/work/job/clip.ja.srt"));
        assert_eq!(out, PathBuf::from("/work/job/clip.ja.mkv"));
    }
}
