//! Provider identity changes and the reindex transition.

mod common;

use common::{open_at, open_engine_with_dim};
use mnemo_engine::{FindRequest, PutRequest};

#[tokio::test]
async fn first_embed_records_the_identity() {
    let (_tmp, engine) = open_engine_with_dim(8).await;

    engine.put(PutRequest::content("hello world")).await.unwrap();

    let identity = engine.embedding_identity().await.unwrap().unwrap();
    assert_eq!(identity.provider, "stub");
    assert_eq!(identity.dimension, 8);
    assert_eq!(engine.vectors().dimension().await.unwrap(), Some(8));
    assert!(!engine.is_reindexing().await.unwrap());
}

#[tokio::test]
async fn dimension_swap_enters_reindex_and_recovers_after_drain() {
    let tmp = tempfile::TempDir::new().unwrap();

    // Index one doc at dimension 8.
    let engine = open_at(tmp.path(), 8).await;
    let item = engine.put(PutRequest::content("X marks the spot")).await.unwrap();
    engine.drain_pending().await.unwrap();
    assert!(engine
        .find(FindRequest::query("X marks the spot"))
        .await
        .unwrap()
        .iter()
        .any(|i| i.id == item.id));
    engine.close().await;

    // Reopen with a 16-dimensional provider: the store notices the
    // identity change and rebuilds.
    let engine = open_at(tmp.path(), 16).await;
    assert!(engine.is_reindexing().await.unwrap());
    assert_eq!(engine.vectors().dimension().await.unwrap(), Some(16));

    // Degraded window: the doc row survives, the vector is gone.
    let results = engine.find(FindRequest::query("X marks the spot")).await.unwrap();
    assert!(results.is_empty());
    assert!(engine.get(&item.id).await.unwrap().is_some());

    // Draining the reembed queue restores search.
    engine.drain_pending().await.unwrap();
    assert!(!engine.is_reindexing().await.unwrap());
    let results = engine.find(FindRequest::query("X marks the spot")).await.unwrap();
    assert_eq!(results[0].id, item.id);
    assert!(results[0].score.unwrap() > 0.999);
}

#[tokio::test]
async fn versions_and_parts_reembed_too() {
    let tmp = tempfile::TempDir::new().unwrap();

    let engine = open_at(tmp.path(), 8).await;
    engine.put(PutRequest::content("state one").with_id("doc")).await.unwrap();
    engine.put(PutRequest::content("state two").with_id("doc")).await.unwrap();
    engine.drain_pending().await.unwrap();
    assert!(engine.vectors().get_vector("doc@v1").await.unwrap().is_some());
    engine.close().await;

    let engine = open_at(tmp.path(), 16).await;
    engine.drain_pending().await.unwrap();

    let current = engine.vectors().get_vector("doc").await.unwrap().unwrap();
    assert_eq!(current.len(), 16);
    let archived = engine.vectors().get_vector("doc@v1").await.unwrap().unwrap();
    assert_eq!(archived.len(), 16);
}
