//! Deterministic stub providers for tests.
//!
//! The stub embedder derives a unit vector from a digest of the input
//! text, so identical texts embed identically (cosine exactly 1) and
//! different texts land elsewhere on the sphere. No network involved.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use mnemo_core::config::EmbeddingIdentity;
use mnemo_core::tags::TagMap;

use crate::errors::EngineResult;
use crate::providers::{AnalyzedPart, Embedder, Summarizer};

#[derive(Debug, Clone)]
pub struct StubEmbedder {
    pub dimension: usize,
    pub model: String,
}

impl StubEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model: format!("stub-{dimension}"),
        }
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        let mut values: Vec<f32> = (0..self.dimension)
            .map(|i| {
                let byte = digest[i % digest.len()];
                // Spread across [-1, 1), perturbed by position so short
                // dims still differ between texts.
                (byte as f32 + (i / digest.len()) as f32) % 251.0 / 125.5 - 1.0
            })
            .collect();
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        } else {
            values[0] = 1.0;
        }
        values
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    fn identity(&self) -> EmbeddingIdentity {
        EmbeddingIdentity {
            provider: "stub".into(),
            model: self.model.clone(),
            dimension: self.dimension,
        }
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        Ok(self.vector_for(text))
    }
}

/// Summarizer that truncates instead of calling a model, and analyzes
/// by splitting on blank lines.
#[derive(Debug, Clone, Default)]
pub struct StubSummarizer {
    pub max_len: usize,
}

impl StubSummarizer {
    pub fn new() -> Self {
        Self { max_len: 120 }
    }
}

#[async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(&self, text: &str, _system_prompt: &str) -> EngineResult<String> {
        Ok(text.chars().take(self.max_len.max(1)).collect())
    }

    async fn analyze(
        &self,
        text: &str,
        _guide: &str,
        _system_prompt: &str,
    ) -> EngineResult<Vec<AnalyzedPart>> {
        Ok(text
            .split("\n\n")
            .map(str::trim)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| AnalyzedPart {
                summary: chunk.lines().next().unwrap_or("").chars().take(80).collect(),
                content: chunk.to_string(),
                tags: TagMap::new(),
            })
            .collect())
    }
}
