//! Shared test scaffolding: a temp-dir store with stub providers.
#![allow(dead_code)]

use std::sync::Arc;

use mnemo_core::config::StoreSettings;
use mnemo_engine::providers::ProviderRouter;
use mnemo_engine::testing::{StubEmbedder, StubSummarizer};
use mnemo_engine::MemoryEngine;
use tempfile::TempDir;

pub const TEST_DIM: usize = 8;

pub async fn open_engine() -> (TempDir, MemoryEngine) {
    open_engine_with_dim(TEST_DIM).await
}

pub async fn open_engine_with_dim(dim: usize) -> (TempDir, MemoryEngine) {
    let tmp = TempDir::new().expect("tempdir");
    let engine = open_at(tmp.path(), dim).await;
    (tmp, engine)
}

pub async fn open_at(path: &std::path::Path, dim: usize) -> MemoryEngine {
    let settings = StoreSettings::new(path);
    let router = ProviderRouter::new(settings.clone())
        .with_embedder(Arc::new(StubEmbedder::new(dim)))
        .with_summarizer(Arc::new(StubSummarizer::new()));
    MemoryEngine::open_with_providers(settings, router)
        .await
        .expect("open engine")
}

pub fn tags(pairs: &[(&str, &str)]) -> mnemo_core::tags::TagMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Declare `.tag/{key}` as an edge key with the given inverse verb.
/// `_inverse` is a system tag, so tests write the tagdoc through the
/// storage layer the way bundled docs are written.
pub async fn declare_edge_key(engine: &MemoryEngine, key: &str, inverse: &str) {
    use mnemo_db::documents::{insert_document, DocumentWrite};
    use mnemo_db::edges::EdgeDelta;

    let mut doc_tags = tags(&[("category", "system")]);
    doc_tags.insert("_inverse".into(), inverse.to_string());
    doc_tags.insert("_source".into(), "inline".into());
    let write = DocumentWrite {
        id: format!(".tag/{key}"),
        summary: format!("Tag: {key}"),
        tags: doc_tags,
        content_hash: None,
        content_hash_full: None,
        created_at_override: None,
    };
    insert_document(
        engine.pool(),
        &write,
        &EdgeDelta::default(),
        &mnemo_core::time::now_ts(),
    )
    .await
    .expect("declare edge key");
}
