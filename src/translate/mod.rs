// Translation
//
// The translate phase maps transcript segments to the target language while
// keeping their timing. `Translator` is the seam the orchestrator calls;
// `OllamaTranslator` talks to a local Ollama server.

pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TranslateConfig;
use crate::error::Result;
use crate::transcribe::TranscriptSegment;

/// Segment after translation; timing is carried over unchanged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedSegment {
    pub start: f64,
    pub end: f64,
    pub source_text: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub translated_segments: Vec<TranslatedSegment>,
    /// 0.0-1.0
    pub confidence: f32,
    pub token_usage: TokenUsage,
}

/// Main trait for translation operations
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        segments: Vec<TranscriptSegment>,
        target_language: String,
        style: Option<String>,
    ) -> Result<TranslationResult>;
}

/// Translator implementation type
#[derive(Debug, Clone)]
pub enum TranslatorImplementation {
    Ollama,
}

/// Factory for creating translator instances
pub struct TranslatorFactory;

impl TranslatorFactory {
    pub fn create_translator(
        implementation: TranslatorImplementation,
        config: TranslateConfig,
    ) -> Result<Box<dyn Translator>> {
        match implementation {
            TranslatorImplementation::Ollama => Ok(Box::new(ollama::OllamaTranslator::new(config)?)),
        }
    }

    pub fn create_default(config: TranslateConfig) -> Result<Box<dyn Translator>> {
        Self::create_translator(TranslatorImplementation::Ollama, config)
    }
}

/// English name for common language codes, used in prompts.
pub fn language_name(code: &str) -> String {
    let name = match code.to_lowercase().as_str() {
        "en" => "English",
        "ja" => "Japanese",
        "ko" => "Korean",
        "zh" => "Chinese",
        "fr" => "French",
        "de" => "German",
        "es" => "Spanish",
        "ru" => "Russian",
        "it" => "Italian",
        "pt" => "Portuguese",
        "pl" => "Polish",
        "nl" => "Dutch",
        "tr" => "Turkish",
        "ar" => "Arabic",
        "hi" => "Hindi",
        "th" => "Thai",
        "vi" => "Vietnamese",
        "sv" => "Swedish",
        "da" => "Danish",
        "no" => "Norwegian",
        "fi" => "Finnish",
        "he" => "Hebrew",
        "cs" => "Czech",
        "uk" => "Ukrainian",
        "id" => "Indonesian",
        _ => return code.to_string(),
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_name() {
        assert_eq!(language_name("JA"), "Japanese");
        assert_eq!(language_name("xx"), "xx");
    }

    #[test]
    fn test_token_usage_add() {
        let mut usage = TokenUsage::default();
        usage.add(TokenUsage { prompt_tokens: 10, completion_tokens: 4 });
        usage.add(TokenUsage { prompt_tokens: 5, completion_tokens: 1 });
        assert_eq!(usage, TokenUsage { prompt_tokens: 15, completion_tokens: 5 });
    }
}
