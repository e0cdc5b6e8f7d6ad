use std::path::Path;
use tokio::fs;
use tracing::info;

use crate::error::Result;
use crate::translate::TranslatedSegment;

/// Render translated segments as SRT text.
pub fn render_srt(segments: &[TranslatedSegment]) -> String {
    let mut srt_content = String::new();

    for (index, segment) in segments.iter().enumerate() {
        srt_content.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            format_srt_time(segment.start),
            format_srt_time(segment.end),
            segment.text.trim()
        ));
    }

    srt_content
}

/// Write an SRT caption track for `segments` to `output_path`.
pub async fn generate_srt<P: AsRef<Path>>(segments: &[TranslatedSegment], output_path: P) -> Result<()> {
    let output_path = output_path.as_ref();
    info!("Generating SRT file: {}", output_path.display());

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(output_path, render_srt(segments)).await?;

    Ok(())
}

/// Format time in seconds to SRT time format (HH:MM:SS,mmm)
fn format_srt_time(seconds: f64) -> String {
    let total_milliseconds = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_milliseconds / 3_600_000;
    let minutes = (total_milliseconds % 3_600_000) / 60_000;
    let secs = (total_milliseconds % 60_000) / 1_000;
    let millis = total_milliseconds % 1_000;

    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_srt_time() {
        assert_eq!(format_srt_time(0.0), "00:00:00,000");
        assert_eq!(format_srt_time(65.123), "00:01:05,123");
        assert_eq!(format_srt_time(3661.500), "01:01:01,500");
        assert_eq!(format_srt_time(1.001), "00:00:01,001");
    }

    #[tokio::test]
    async fn test_generate_srt_writes_numbered_cues() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("clip.ja.srt");
        let segments = vec![
            TranslatedSegment { start: 0.0, end: 1.5, source_text: "Hello".into(), text: "こんにちは".into() },
            TranslatedSegment { start: 1.5, end: 3.0, source_text: "Bye".into(), text: " さようなら ".into() },
        ];

        generate_srt(&segments, &path).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "1\n00:00:00,000 --> 00:00:01,500\nこんにちは\n\n2\n00:00:01,500 --> 00:00:03,000\nさようなら\n\n"
        );
    }
}
