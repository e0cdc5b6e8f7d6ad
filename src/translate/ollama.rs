use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::TranslateConfig;
use crate::error::{Result, SubflowError};
use crate::transcribe::TranscriptSegment;
use super::{language_name, TokenUsage, TranslatedSegment, TranslationResult, Translator};

#[derive(Debug, Clone, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct TranslatedText {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Translates segment by segment through Ollama's `/api/generate`, passing a
/// few preceding source lines as context.
pub struct OllamaTranslator {
    client: Client,
    config: TranslateConfig,
}

impl OllamaTranslator {
    pub fn new(config: TranslateConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn build_prompt(&self, text: &str, target_language: &str, context: &[&str], style: Option<&str>) -> String {
        let name = language_name(target_language);
        let mut prompt = format!(
            "You are a professional subtitle translator.\n\
             \n\
             CRITICAL: You must translate the text to {} ONLY. Do not translate to any other language.\n\
             The target language is: {} (language code: {})\n\
             \n\
             Return ONLY the translation in JSON format as {{\"text\":\"your {} translation here\",\"confidence\":0.0-1.0}}.\n\
             Do not include any explanations, alternatives, or text in other languages.\n",
            name, name, target_language, name
        );
        if let Some(style) = style {
            prompt.push_str(&format!("Use a {} register.\n", style));
        }
        prompt.push_str(&format!("\n[Text to translate]\n{}\n", text));
        if !context.is_empty() {
            prompt.push_str(&format!(
                "\n[Context for reference - DO NOT translate this part]\n{}\n",
                context.join("\n")
            ));
        }
        prompt
    }

    async fn translate_text(&self, prompt: String) -> Result<(TranslatedText, TokenUsage)> {
        let request = GenerateRequest {
            model: self.config.model.clone(),
            prompt,
            stream: false,
            format: "json".to_string(),
        };
        let url = format!("{}/api/generate", self.config.endpoint.trim_end_matches('/'));
        debug!("Sending translation request to: {}", url);

        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(SubflowError::Translation(format!("Ollama API error {}: {}", status, error_text)));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| SubflowError::Translation(format!("Failed to parse response: {}", e)))?;
        let usage = TokenUsage {
            prompt_tokens: body.prompt_eval_count.unwrap_or_default(),
            completion_tokens: body.eval_count.unwrap_or_default(),
        };
        Ok((parse_translation(&body.response)?, usage))
    }
}

/// Accept the requested JSON shape, falling back to the first plausible
/// line of free text when the model ignores the format.
fn parse_translation(raw: &str) -> Result<TranslatedText> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SubflowError::Translation("Empty translation received".to_string()));
    }
    if let Ok(parsed) = serde_json::from_str::<TranslatedText>(raw) {
        if !parsed.text.trim().is_empty() {
            return Ok(TranslatedText {
                text: parsed.text.trim().to_string(),
                confidence: parsed.confidence.map(|c| c.clamp(0.0, 1.0)),
            });
        }
        return Err(SubflowError::Translation("Empty translation received".to_string()));
    }

    let line = raw
        .lines()
        .map(str::trim)
        .find(|line| {
            !line.is_empty()
                && !line.starts_with("Here are")
                && !line.starts_with("Translation:")
                && !(line.starts_with("**") && line.ends_with("**"))
        })
        .unwrap_or(raw);
    Ok(TranslatedText {
        text: line.to_string(),
        confidence: None,
    })
}

#[async_trait]
impl Translator for OllamaTranslator {
    async fn translate(
        &self,
        segments: Vec<TranscriptSegment>,
        target_language: String,
        style: Option<String>,
    ) -> Result<TranslationResult> {
        info!("Translating {} segments to {} with {}", segments.len(), target_language, self.config.model);

        let mut translated_segments = Vec::with_capacity(segments.len());
        let mut usage = TokenUsage::default();
        let mut confidences = Vec::with_capacity(segments.len());

        for (index, segment) in segments.iter().enumerate() {
            let context: Vec<&str> = segments[index.saturating_sub(self.config.context_window)..index]
                .iter()
                .map(|s| s.text.as_str())
                .collect();
            let prompt = self.build_prompt(&segment.text, &target_language, &context, style.as_deref());
            let (translated, segment_usage) = self.translate_text(prompt).await?;

            usage.add(segment_usage);
            confidences.push(translated.confidence.unwrap_or(segment.confidence));
            translated_segments.push(TranslatedSegment {
                start: segment.start,
                end: segment.end,
                source_text: segment.text.clone(),
                text: translated.text,
            });
        }

        let confidence = crate::transcribe::mean_confidence(confidences.into_iter());
        info!(
            "Translation finished: {} segments, {} prompt / {} completion tokens",
            translated_segments.len(),
            usage.prompt_tokens,
            usage.completion_tokens
        );

        Ok(TranslationResult {
            translated_segments,
            confidence,
            token_usage: usage,
        })
    }
}
