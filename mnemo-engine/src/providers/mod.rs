//! Provider capabilities and the router that dispatches to them.
//!
//! Providers are the only places the engine blocks on the network.
//! Handles are built lazily on first use; a backend that cannot be
//! reached surfaces `ProviderUnavailable` / `ProviderTransient` at call
//! time, never a crash at construction.

pub mod cache;
pub mod embedding;
pub mod fetch;
pub mod llm;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use mnemo_core::config::{EmbeddingIdentity, StoreSettings};
use mnemo_core::tags::TagMap;
use sqlx::SqlitePool;

use crate::errors::{EngineError, EngineResult};
use cache::EmbeddingCache;
use embedding::EmbeddingClient;
use fetch::FetchedDocument;
use llm::LlmClient;

/// Embedding capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn identity(&self) -> EmbeddingIdentity;

    /// Whether synchronous foreground calls are acceptable. Local
    /// small-vector backends are; network backends defer write-path
    /// embedding to the queue instead.
    fn is_cheap(&self) -> bool {
        true
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}

/// One section produced by structural analysis.
#[derive(Debug, Clone)]
pub struct AnalyzedPart {
    pub summary: String,
    pub content: String,
    pub tags: TagMap,
}

/// Summarization / analysis / media description capability.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, system_prompt: &str) -> EngineResult<String>;

    async fn analyze(
        &self,
        text: &str,
        guide: &str,
        system_prompt: &str,
    ) -> EngineResult<Vec<AnalyzedPart>>;

    /// Describe non-text media. Default: not supported.
    async fn describe(&self, _bytes: &[u8], _content_type: &str) -> EngineResult<String> {
        Err(EngineError::ProviderUnavailable("media description"))
    }
}

/// Per-capability provider handles, built lazily from settings.
pub struct ProviderRouter {
    settings: StoreSettings,
    embedder: OnceLock<Arc<dyn Embedder>>,
    summarizer: OnceLock<Arc<dyn Summarizer>>,
    cache: EmbeddingCache,
    http: reqwest::Client,
}

impl ProviderRouter {
    pub fn new(settings: StoreSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.provider_timeout_secs))
            .build()
            .unwrap_or_default();
        let cache = EmbeddingCache::new(settings.embedding_cache_size);
        Self {
            settings,
            embedder: OnceLock::new(),
            summarizer: OnceLock::new(),
            cache,
            http,
        }
    }

    /// Install a specific embedder (tests, alternative backends).
    pub fn with_embedder(self, embedder: Arc<dyn Embedder>) -> Self {
        let _ = self.embedder.set(embedder);
        self
    }

    /// Install a specific summarizer.
    pub fn with_summarizer(self, summarizer: Arc<dyn Summarizer>) -> Self {
        let _ = self.summarizer.set(summarizer);
        self
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        self.embedder.get_or_init(|| {
            Arc::new(EmbeddingClient::new(&self.settings)) as Arc<dyn Embedder>
        })
    }

    pub fn summarizer(&self) -> &Arc<dyn Summarizer> {
        self.summarizer.get_or_init(|| {
            Arc::new(LlmClient::new(&self.settings)) as Arc<dyn Summarizer>
        })
    }

    /// The active embedding identity. The dimension may be a declared
    /// value before the first call has discovered the real one.
    pub fn embedding_identity(&self) -> EmbeddingIdentity {
        self.embedder().identity()
    }

    /// Whether the write path may embed synchronously (see
    /// [`Embedder::is_cheap`]).
    pub fn embedding_is_cheap(&self) -> bool {
        self.embedder().is_cheap()
    }

    /// Embed through the two-level cache: in-memory LRU first, then the
    /// persistent table, then the provider.
    pub async fn embed(&self, pool: &SqlitePool, text: &str) -> EngineResult<Vec<f32>> {
        let identity = self.embedding_identity();
        if let Some(hit) = self.cache.get(pool, &identity, text).await? {
            return Ok(hit);
        }
        let vector = self.embedder().embed(text).await?;
        self.cache.put(pool, &identity, text, &vector).await?;
        Ok(vector)
    }

    pub async fn summarize(&self, text: &str, system_prompt: &str) -> EngineResult<String> {
        self.summarizer().summarize(text, system_prompt).await
    }

    pub async fn analyze(
        &self,
        text: &str,
        guide: &str,
        system_prompt: &str,
    ) -> EngineResult<Vec<AnalyzedPart>> {
        self.summarizer().analyze(text, guide, system_prompt).await
    }

    pub async fn describe(&self, bytes: &[u8], content_type: &str) -> EngineResult<String> {
        self.summarizer().describe(bytes, content_type).await
    }

    /// Fetch a URI to bytes + content type.
    pub async fn fetch(&self, uri: &str) -> EngineResult<FetchedDocument> {
        fetch::fetch(&self.http, uri).await
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("embedding_model", &self.settings.embedding_model)
            .field("summarize_model", &self.settings.summarize_model)
            .finish()
    }
}
