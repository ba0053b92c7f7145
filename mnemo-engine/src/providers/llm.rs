//! Chat-completions client used for summarization and analysis.
//!
//! Speaks the OpenAI-compatible chat API that Ollama and OpenRouter both
//! expose. Analysis responses use a line-oriented section format:
//!
//! ```text
//! ## <one-line summary>
//! tags: key=value key=value
//! <section content…>
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mnemo_core::config::StoreSettings;
use mnemo_core::tags::TagMap;

use crate::errors::{EngineError, EngineResult};
use crate::providers::embedding::classify_status;
use crate::providers::{AnalyzedPart, Summarizer};

const MAX_COMPLETION_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct LlmClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(settings: &StoreSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.provider_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            base_url: settings.summarize_url.trim_end_matches('/').to_string(),
            model: settings.summarize_model.clone(),
            api_key: std::env::var("OPENROUTER_API_KEY").ok(),
            client,
        }
    }

    async fn chat(&self, system: &str, user: &str) -> EngineResult<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: user.to_string(),
                },
            ],
            max_tokens: MAX_COMPLETION_TOKENS,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(
                status,
                format!("chat completion failed: {status} {text}"),
            ));
        }

        let payload: ChatResponse = response.json().await?;
        payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| EngineError::ProviderFatal("chat completion returned no content".into()))
    }
}

#[async_trait]
impl Summarizer for LlmClient {
    async fn summarize(&self, text: &str, system_prompt: &str) -> EngineResult<String> {
        self.chat(system_prompt, text).await
    }

    async fn analyze(
        &self,
        text: &str,
        guide: &str,
        system_prompt: &str,
    ) -> EngineResult<Vec<AnalyzedPart>> {
        let user = if guide.is_empty() {
            text.to_string()
        } else {
            format!("{guide}\n\n---\n\n{text}")
        };
        let raw = self.chat(system_prompt, &user).await?;
        Ok(parse_sections(&raw))
    }
}

/// Parse the `## summary` section format into parts. Content before the
/// first heading is dropped (preamble chatter).
pub fn parse_sections(raw: &str) -> Vec<AnalyzedPart> {
    let mut parts = Vec::new();
    let mut current: Option<AnalyzedPart> = None;

    for line in raw.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            if let Some(part) = current.take() {
                parts.push(part);
            }
            current = Some(AnalyzedPart {
                summary: heading.trim().to_string(),
                content: String::new(),
                tags: TagMap::new(),
            });
            continue;
        }
        let Some(part) = current.as_mut() else {
            continue;
        };
        if let Some(tag_line) = line.strip_prefix("tags:") {
            for token in tag_line.split_whitespace() {
                if let Some((k, v)) = token.split_once('=') {
                    if !k.is_empty() && !v.is_empty() {
                        part.tags.insert(k.to_lowercase(), v.to_string());
                    }
                }
            }
            continue;
        }
        if !part.content.is_empty() {
            part.content.push('\n');
        }
        part.content.push_str(line);
    }
    if let Some(part) = current.take() {
        parts.push(part);
    }

    for part in &mut parts {
        part.content = part.content.trim().to_string();
        if part.content.is_empty() {
            part.content = part.summary.clone();
        }
    }
    parts
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_with_tags() {
        let raw = "preamble to ignore\n## First section\ntags: act=commitment topic=auth\nBody line one.\nBody line two.\n## Second section\nOther body.";
        let parts = parse_sections(raw);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].summary, "First section");
        assert_eq!(parts[0].tags.get("act").map(String::as_str), Some("commitment"));
        assert!(parts[0].content.contains("Body line two."));
        assert_eq!(parts[1].summary, "Second section");
        assert_eq!(parts[1].content, "Other body.");
    }

    #[test]
    fn empty_content_falls_back_to_summary() {
        let parts = parse_sections("## Only heading");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content, "Only heading");
    }
}
