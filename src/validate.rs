//! Pre-flight checks on a job's input, run before it leaves `queued`.

use std::path::Path;

use crate::error::{Result, SubflowError};
use crate::job::JobInput;

pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "mkv", "avi", "webm", "m4v", "mp3", "wav", "m4a", "flac",
];

/// `xx`, `xxx` or `xx-YY`.
pub fn is_language_code(code: &str) -> bool {
    let mut parts = code.split('-');
    let primary = parts.next().unwrap_or_default();
    let region = parts.next();
    if parts.next().is_some() {
        return false;
    }

    let primary_ok = (2..=3).contains(&primary.len()) && primary.chars().all(|c| c.is_ascii_lowercase());
    let region_ok = region.is_none_or(|r| r.len() == 2 && r.chars().all(|c| c.is_ascii_uppercase()));
    primary_ok && region_ok
}

fn media_extension(source_ref: &str) -> Option<String> {
    let path = source_ref.split(['?', '#']).next().unwrap_or(source_ref);
    Path::new(path)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

/// Validate `input`, returning the names of the checks that passed.
pub fn validate_input(input: &JobInput) -> Result<Vec<String>> {
    let mut checks = Vec::new();

    if input.source_ref.trim().is_empty() {
        return Err(SubflowError::Validation("source reference is empty".to_string()));
    }
    checks.push("source_ref".to_string());

    match media_extension(&input.source_ref) {
        Some(ext) if MEDIA_EXTENSIONS.contains(&ext.as_str()) => checks.push("media_type".to_string()),
        Some(ext) => {
            return Err(SubflowError::Validation(format!("unsupported media type '.{}'", ext)));
        }
        None => {
            return Err(SubflowError::Validation(format!(
                "cannot determine media type of '{}'",
                input.source_ref
            )));
        }
    }

    if !is_language_code(&input.target_language) {
        return Err(SubflowError::Validation(format!(
            "invalid target language '{}'",
            input.target_language
        )));
    }
    checks.push("target_language".to_string());

    if let Some(source) = &input.options.source_language {
        if !is_language_code(source) {
            return Err(SubflowError::Validation(format!("invalid source language '{}'", source)));
        }
        if source == &input.target_language {
            return Err(SubflowError::Validation(format!(
                "source and target language are both '{}'",
                source
            )));
        }
        checks.push("source_language".to_string());
    }

    if input.options.timeout_secs == Some(0) {
        return Err(SubflowError::Validation("timeout must be positive".to_string()));
    }

    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;

    #[test]
    fn test_language_codes() {
        for ok in ["ja", "fil", "pt-BR", "zh-TW"] {
            assert!(is_language_code(ok), "{}", ok);
        }
        for bad in ["", "j", "JA", "english", "pt-br", "pt-BR-x", "en_US"] {
            assert!(!is_language_code(bad), "{}", bad);
        }
    }

    #[test]
    fn test_valid_input_lists_checks() {
        let input = JobInput::new("https://cdn.example.com/clip.MP4?sig=abc", "ja").with_options(JobOptions {
            source_language: Some("en".into()),
            ..JobOptions::default()
        });
        let checks = validate_input(&input).unwrap();
        assert_eq!(checks, vec!["source_ref", "media_type", "target_language", "source_language"]);
    }

    #[test]
    fn test_rejections() {
        let cases = [
            JobInput::new("  ", "ja"),
            JobInput::new("notes.txt", "ja"),
            JobInput::new("clip", "ja"),
            JobInput::new("clip.mp4", "Japanese"),
            JobInput::new("clip.mp4", "en").with_options(JobOptions {
                source_language: Some("en".into()),
                ..JobOptions::default()
            }),
            JobInput::new("clip.mp4", "en").with_options(JobOptions {
                timeout_secs: Some(0),
                ..JobOptions::default()
            }),
        ];
        for input in cases {
            let err = validate_input(&input).unwrap_err();
            assert!(matches!(err, SubflowError::Validation(_)), "{:?}", input);
        }
    }
}
