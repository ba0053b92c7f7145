//! Deferred work: lazy summarization, deferred embedding, dead letters.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{open_engine, open_engine_with_dim};
use mnemo_core::config::{EmbeddingIdentity, StoreSettings};
use mnemo_engine::providers::ProviderRouter;
use mnemo_engine::testing::{StubEmbedder, StubSummarizer};
use mnemo_engine::{Embedder, EngineError, FindRequest, MemoryEngine, PutRequest};

/// Embedder that fails transiently for the first N calls.
struct FlakyEmbedder {
    inner: StubEmbedder,
    failures_left: AtomicU32,
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn identity(&self) -> EmbeddingIdentity {
        self.inner.identity()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::ProviderTransient("connection refused".into()));
        }
        self.inner.embed(text).await
    }
}

async fn open_flaky(failures: u32) -> (tempfile::TempDir, MemoryEngine) {
    let tmp = tempfile::TempDir::new().unwrap();
    let settings = StoreSettings::new(tmp.path());
    let router = ProviderRouter::new(settings.clone())
        .with_embedder(Arc::new(FlakyEmbedder {
            inner: StubEmbedder::new(8),
            failures_left: AtomicU32::new(failures),
        }))
        .with_summarizer(Arc::new(StubSummarizer::new()));
    let engine = MemoryEngine::open_with_providers(settings, router)
        .await
        .unwrap();
    (tmp, engine)
}

/// Embedder that works fine but models a metered network backend:
/// not cheap, and every call is counted.
struct NetworkEmbedder {
    inner: StubEmbedder,
    calls: AtomicU32,
}

#[async_trait]
impl Embedder for NetworkEmbedder {
    fn identity(&self) -> EmbeddingIdentity {
        self.inner.identity()
    }

    fn is_cheap(&self) -> bool {
        false
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(text).await
    }
}

async fn open_network() -> (tempfile::TempDir, MemoryEngine, Arc<NetworkEmbedder>) {
    let tmp = tempfile::TempDir::new().unwrap();
    let settings = StoreSettings::new(tmp.path());
    let embedder = Arc::new(NetworkEmbedder {
        inner: StubEmbedder::new(8),
        calls: AtomicU32::new(0),
    });
    let router = ProviderRouter::new(settings.clone())
        .with_embedder(embedder.clone())
        .with_summarizer(Arc::new(StubSummarizer::new()));
    let engine = MemoryEngine::open_with_providers(settings, router)
        .await
        .unwrap();
    (tmp, engine, embedder)
}

#[tokio::test]
async fn long_content_gets_placeholder_then_background_summary() {
    let (_tmp, engine) = open_engine().await;

    let long_content = "All work and no play makes for dull documentation. ".repeat(20);
    let item = engine
        .put(PutRequest::content(long_content.clone()).with_id("long"))
        .await
        .unwrap();

    // Placeholder: truncated with ellipsis, task queued.
    assert!(item.summary.ends_with("..."));
    assert!(item.summary.len() < long_content.len());
    let stats = engine.pending_stats().await.unwrap();
    assert!(stats.by_kind.iter().any(|(k, _)| k == "summarize"));

    engine.drain_pending().await.unwrap();

    let after = engine.get("long").await.unwrap().unwrap();
    assert!(!after.summary.ends_with("..."));
    assert!(after.summary.len() <= 120);
    // No new version was created by the background summary.
    assert!(engine.list_versions("long", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn caller_summary_skips_the_queue() {
    let (_tmp, engine) = open_engine().await;

    let long_content = "word ".repeat(500);
    engine
        .put(
            PutRequest::content(long_content)
                .with_id("summed")
                .with_summary("the gist of it"),
        )
        .await
        .unwrap();

    let item = engine.get("summed").await.unwrap().unwrap();
    assert_eq!(item.summary, "the gist of it");
    let stats = engine.pending_stats().await.unwrap();
    assert!(!stats.by_kind.iter().any(|(k, _)| k == "summarize"));
}

#[tokio::test]
async fn deferred_embedding_is_invisible_until_repaired() {
    let (_tmp, engine) = open_flaky(1).await;

    let item = engine
        .put(PutRequest::content("a note that arrives during an outage"))
        .await
        .unwrap();
    let stored = engine.get(&item.id).await.unwrap().unwrap();
    assert_eq!(stored.tags.get("_embed_pending").map(String::as_str), Some("1"));

    // Pending entries stay out of search results entirely.
    let results = engine
        .find(FindRequest::query("a note that arrives during an outage"))
        .await
        .unwrap();
    assert!(results.iter().all(|i| i.id != item.id));

    engine.drain_pending().await.unwrap();

    let repaired = engine.get(&item.id).await.unwrap().unwrap();
    assert!(!repaired.tags.contains_key("_embed_pending"));
    let results = engine
        .find(FindRequest::query("a note that arrives during an outage"))
        .await
        .unwrap();
    assert!(results.iter().any(|i| i.id == item.id));
}

#[tokio::test]
async fn network_provider_defers_embedding_unconditionally() {
    let (_tmp, engine, embedder) = open_network().await;

    let item = engine
        .put(PutRequest::content("a note written against a cloud backend"))
        .await
        .unwrap();

    // The foreground write never touched the provider — deferral is a
    // property of the provider kind, not of a failed call.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    let stored = engine.get(&item.id).await.unwrap().unwrap();
    assert_eq!(stored.tags.get("_embed_pending").map(String::as_str), Some("1"));

    engine.drain_pending().await.unwrap();

    assert!(embedder.calls.load(Ordering::SeqCst) > 0);
    let repaired = engine.get(&item.id).await.unwrap().unwrap();
    assert!(!repaired.tags.contains_key("_embed_pending"));
    let results = engine
        .find(FindRequest::query("a note written against a cloud backend"))
        .await
        .unwrap();
    assert!(results.iter().any(|i| i.id == item.id));
}

#[tokio::test]
async fn network_provider_defers_part_embeddings_too() {
    let (_tmp, engine, embedder) = open_network().await;

    let content = "First paragraph about the outage window.\n\n\
                   Second paragraph about the mitigation steps.";
    let item = engine.put(PutRequest::content(content).with_id("postmortem")).await.unwrap();
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);

    let parts = engine.analyze(&item.id, &[], false).await.unwrap();
    assert_eq!(parts.len(), 2);
    // Analysis enqueued the part vectors instead of blocking on the
    // network once per part.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    let stats = engine.pending_stats().await.unwrap();
    assert!(stats.by_kind.iter().any(|(k, n)| k == "reembed" && *n >= 2));

    engine.drain_pending().await.unwrap();
    assert!(engine.vectors().get_vector("postmortem@p1").await.unwrap().is_some());
    assert!(engine.vectors().get_vector("postmortem@p2").await.unwrap().is_some());
}

#[tokio::test]
async fn exhausted_retries_surface_an_error_tag() {
    let (_tmp, engine) = open_flaky(u32::MAX).await;

    let item = engine
        .put(PutRequest::content("forever unreachable"))
        .await
        .unwrap();

    // Force every task through its full retry budget.
    for _ in 0..8 {
        sqlx::query("UPDATE pending_tasks SET retry_after = NULL")
            .execute(engine.pool())
            .await
            .unwrap();
        engine.process_pending(50).await.unwrap();
    }

    let doc = engine.get(&item.id).await.unwrap().unwrap();
    let error = doc.tags.get("_error").expect("_error tag");
    assert!(error.starts_with("provider-transient"));

    let failed = engine.queue().list_failed().await.unwrap();
    assert!(failed.iter().any(|f| f.doc_id == item.id));
}

#[tokio::test]
async fn analyze_decomposes_and_tags_parts() {
    let (_tmp, engine) = open_engine_with_dim(8).await;

    let content = "The first paragraph covers the incident timeline in detail.\n\n\
                   The second paragraph records the root cause analysis.\n\n\
                   The third paragraph lists the follow-up actions agreed.";
    let item = engine.put(PutRequest::content(content).with_id("report")).await.unwrap();

    let parts = engine.analyze(&item.id, &[], false).await.unwrap();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0].part_num, 1);

    // Parts are addressable and retain their full text.
    let p2 = engine.get("report@p2").await.unwrap().unwrap();
    assert!(p2.summary.contains("root cause"));
    assert_eq!(p2.tags.get("_part_num").map(String::as_str), Some("2"));

    // Unchanged content makes re-analysis a no-op.
    let again = engine.analyze(&item.id, &[], false).await.unwrap();
    assert_eq!(again.len(), 3);

    // Part tagging flows through tag_part.
    engine
        .tag_part("report", 2, &common::tags(&[("kind", "analysis")]))
        .await
        .unwrap();
    let tagged = engine.get_part("report", 2).await.unwrap().unwrap();
    assert_eq!(tagged.tags.get("kind").map(String::as_str), Some("analysis"));
}

#[tokio::test]
async fn dedup_probe_copies_vectors_for_identical_content() {
    let (_tmp, engine) = open_engine().await;

    let a = engine
        .put(PutRequest::content("identical payload").with_id("copy-a"))
        .await
        .unwrap();
    let b = engine
        .put(PutRequest::content("identical payload").with_id("copy-b"))
        .await
        .unwrap();

    let va = engine.vectors().get_vector(&a.id).await.unwrap().unwrap();
    let vb = engine.vectors().get_vector(&b.id).await.unwrap().unwrap();
    assert_eq!(va, vb);
}
