//! HTTP embedding client for Ollama and OpenRouter-compatible endpoints.

use async_trait::async_trait;
use serde::Deserialize;

use mnemo_core::config::{EmbeddingIdentity, EmbeddingProviderKind, StoreSettings};

use crate::errors::{EngineError, EngineResult};
use crate::providers::Embedder;

#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    provider: EmbeddingProviderKind,
    base_url: String,
    model: String,
    api_key: Option<String>,
    declared_dim: Option<usize>,
    client: reqwest::Client,
}

impl EmbeddingClient {
    pub fn new(settings: &StoreSettings) -> Self {
        let base_url = settings.embedding_url.trim_end_matches('/').to_string();

        let api_key = match settings.embedding_provider {
            EmbeddingProviderKind::OpenRouter => std::env::var("OPENROUTER_API_KEY").ok(),
            EmbeddingProviderKind::Ollama => None,
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.provider_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            provider: settings.embedding_provider,
            base_url,
            model: settings.embedding_model.clone(),
            api_key,
            declared_dim: settings.embedding_dim,
            client,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed_ollama(&self, input: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/api/embed", self.base_url);
        let body = OllamaEmbedRequest {
            model: self.model.clone(),
            input: vec![input.to_string()],
        };

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, format!("ollama embedding request failed: {status} {text}")));
        }

        let payload: OllamaEmbedResponse = response.json().await?;

        if let Some(mut embeddings) = payload.embeddings {
            if !embeddings.is_empty() {
                return Ok(embeddings.remove(0));
            }
        }
        if let Some(embedding) = payload.embedding {
            return Ok(embedding);
        }

        Err(EngineError::ProviderFatal(
            "ollama embedding response missing vectors".to_string(),
        ))
    }

    async fn embed_openrouter(&self, input: &str) -> EngineResult<Vec<f32>> {
        let api_key = self.api_key.as_deref().ok_or(EngineError::ProviderUnavailable(
            "OpenRouter embedding (OPENROUTER_API_KEY not set)",
        ))?;

        let url = format!("{}/embeddings", self.base_url);
        let body = OpenRouterEmbedRequest {
            model: self.model.clone(),
            input: vec![input.to_string()],
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, format!("openrouter embedding request failed: {status} {text}")));
        }

        let payload: OpenRouterEmbedResponse = response.json().await?;
        payload
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EngineError::ProviderFatal("openrouter embedding response empty".to_string()))
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    fn identity(&self) -> EmbeddingIdentity {
        EmbeddingIdentity {
            provider: self.provider.as_str().to_string(),
            model: self.model.clone(),
            dimension: self.declared_dim.unwrap_or(0),
        }
    }

    /// Ollama runs on the local host; OpenRouter is a metered network
    /// service whose latency does not belong in the foreground write.
    fn is_cheap(&self) -> bool {
        match self.provider {
            EmbeddingProviderKind::Ollama => true,
            EmbeddingProviderKind::OpenRouter => false,
        }
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        match self.provider {
            EmbeddingProviderKind::Ollama => self.embed_ollama(text).await,
            EmbeddingProviderKind::OpenRouter => self.embed_openrouter(text).await,
        }
    }
}

pub(crate) fn classify_status(status: reqwest::StatusCode, message: String) -> EngineError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        EngineError::ProviderTransient(message)
    } else {
        EngineError::ProviderFatal(message)
    }
}

// ── Ollama wire types ─────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
struct OllamaEmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Option<Vec<Vec<f32>>>,
    embedding: Option<Vec<f32>>,
}

// ── OpenRouter wire types ─────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
struct OpenRouterEmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenRouterEmbedResponse {
    data: Vec<OpenRouterEmbedding>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenRouterEmbedding {
    embedding: Vec<f32>,
}
