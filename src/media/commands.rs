use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SubflowError};

/// Abstract media processing command representation
#[derive(Debug, Clone)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    pub fn video_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:v").arg(codec)
    }

    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    pub fn copy_audio(self) -> Self {
        self.audio_codec("copy")
    }

    pub fn no_video(self) -> Self {
        self.arg("-vn")
    }

    pub fn audio_sample_rate(self, rate: u32) -> Self {
        self.arg("-ar").arg(rate.to_string())
    }

    pub fn audio_channels(self, channels: u32) -> Self {
        self.arg("-ac").arg(channels.to_string())
    }

    pub fn video_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-vf").arg(filter)
    }

    /// Execute the command, discarding its output
    pub async fn execute(&self) -> Result<()> {
        self.capture().await.map(|_| ())
    }

    /// Execute the command and return its stdout
    pub async fn capture(&self) -> Result<String> {
        debug!("Executing media command ({}): {} {:?}", self.description, self.binary_path, self.args);

        let output = Command::new(&self.binary_path)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SubflowError::Media(format!("Failed to execute {}: {}", self.binary_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SubflowError::Media(format!(
                "{} failed: {}",
                self.description,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Builder for the media operations the pipeline needs
pub struct MediaCommandBuilder {
    binary_path: String,
}

impl MediaCommandBuilder {
    pub fn new<S: Into<String>>(binary_path: S) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Build subtitle embedding command
    pub fn embed_subtitles<P: AsRef<Path>>(
        &self,
        video_path: P,
        subtitle_path: P,
        output_path: P,
        additional_options: &[String],
    ) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Subtitle embedding")
            .overwrite()
            .input(&video_path)
            .video_filter(format!("subtitles={}", escape_filter_path(subtitle_path.as_ref())))
            .video_codec("libx264")
            .copy_audio()
            .args(additional_options.iter().cloned())
            .output(output_path)
    }

    /// Build audio extraction command (16 kHz mono PCM, as whisper expects)
    pub fn extract_audio<P: AsRef<Path>>(&self, video_path: P, audio_path: P) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Audio extraction")
            .input(video_path)
            .no_video()
            .audio_codec("pcm_s16le")
            .audio_sample_rate(16000)
            .audio_channels(1)
            .overwrite()
            .output(audio_path)
    }

    /// Build an ffprobe query for duration and first video stream size.
    /// `binary_path` must point at ffprobe for this one.
    pub fn probe<P: AsRef<Path>>(&self, media_path: P) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Media probe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height:format=duration",
                "-of",
                "json",
            ])
            .output(media_path)
    }
}

/// ffmpeg filter arguments treat `:` and `'` specially.
fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embed_subtitles_arguments() {
        let builder = MediaCommandBuilder::new("ffmpeg");
        let options = vec!["-crf".to_string(), "23".to_string()];
        let cmd = builder.embed_subtitles(Path::new("in.mp4"), Path::new("subs.srt"), Path::new("out.mp4"), &options);

        assert_eq!(cmd.binary_path, "ffmpeg");
        assert_eq!(
            cmd.args,
            vec!["-y", "-i", "in.mp4", "-vf", "subtitles=subs.srt", "-c:v", "libx264", "-c:a", "copy", "-crf", "23", "out.mp4"]
        );
    }

    #[test]
    fn test_extract_audio_arguments() {
        let cmd = MediaCommandBuilder::new("ffmpeg").extract_audio(Path::new("in.mp4"), Path::new("a.wav"));
        assert!(cmd.args.windows(2).any(|w| w[0] == "-ar" && w[1] == "16000"));
        assert_eq!(cmd.args.last().map(String::as_str), Some("a.wav"));
    }

    #[test]
    fn test_filter_path_escaping() {
        assert_eq!(escape_filter_path(Path::new("C:/subs/it's.srt")), "C\\:/subs/it\\'s.srt");
    }

    #[tokio::test]
    async fn test_missing_binary_is_media_error() {
        let cmd = MediaCommand::new("definitely-not-a-real-binary-subflow", "Probe");
        let err = cmd.execute().await.unwrap_err();
        assert!(matches!(err, SubflowError::Media(_)));
    }
}
