//! Pre-filter soundness and dimension pinning on the vector store.

use std::collections::BTreeMap;

use mnemo_db::test_helpers::create_test_pool;
use mnemo_db::{DbError, VectorFilter, VectorStore};

fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn unit(dir: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; 4];
    v[dir] = 1.0;
    v
}

async fn seed(store: &VectorStore) {
    store
        .upsert("a", &unit(0), "alpha", &tags(&[("topic", "api")]), "2025-01-01T00:00:00.000000Z", "2025-01-01T00:00:00.000000Z")
        .await
        .unwrap();
    store
        .upsert("b", &unit(0), "beta", &tags(&[("topic", "quota")]), "2025-01-02T00:00:00.000000Z", "2025-01-02T00:00:00.000000Z")
        .await
        .unwrap();
    store
        .upsert("c", &unit(1), "gamma", &tags(&[("topic", "api"), ("_embed_pending", "1")]), "2025-01-03T00:00:00.000000Z", "2025-01-03T00:00:00.000000Z")
        .await
        .unwrap();
}

#[tokio::test]
async fn tag_prefilter_is_sound() {
    let pool = create_test_pool().await.unwrap();
    let store = VectorStore::new(pool);
    seed(&store).await;

    let filter = VectorFilter {
        tags: tags(&[("topic", "api")]),
        ..Default::default()
    };
    let hits = store.query(&unit(0), &filter, 10).await.unwrap();
    // "b" has the wrong tag, "c" is embed-pending; only "a" may appear,
    // no matter how high the others' cosine would be.
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key, "a");
    assert!(hits[0].similarity > 0.99);
}

#[tokio::test]
async fn key_presence_filter() {
    let pool = create_test_pool().await.unwrap();
    let store = VectorStore::new(pool);
    seed(&store).await;

    let filter = VectorFilter {
        tags: tags(&[("topic", "*")]),
        ..Default::default()
    };
    let hits = store.query(&unit(0), &filter, 10).await.unwrap();
    let keys: Vec<&str> = hits.iter().map(|h| h.key.as_str()).collect();
    assert!(keys.contains(&"a"));
    assert!(keys.contains(&"b"));
    assert!(!keys.contains(&"c"), "pending entries stay invisible");
}

#[tokio::test]
async fn time_window_filters_on_updated_at() {
    let pool = create_test_pool().await.unwrap();
    let store = VectorStore::new(pool);
    seed(&store).await;

    let filter = VectorFilter {
        since: Some("2025-01-02T00:00:00.000000Z".into()),
        ..Default::default()
    };
    let hits = store.query(&unit(0), &filter, 10).await.unwrap();
    let keys: Vec<&str> = hits.iter().map(|h| h.key.as_str()).collect();
    assert!(!keys.contains(&"a"));
    assert!(keys.contains(&"b"));
}

#[tokio::test]
async fn dimension_is_pinned_by_first_vector() {
    let pool = create_test_pool().await.unwrap();
    let store = VectorStore::new(pool);
    store
        .upsert("a", &unit(0), "alpha", &tags(&[]), "2025-01-01T00:00:00.000000Z", "2025-01-01T00:00:00.000000Z")
        .await
        .unwrap();
    assert_eq!(store.dimension().await.unwrap(), Some(4));

    let err = store
        .upsert("b", &vec![0.0f32; 8], "beta", &tags(&[]), "2025-01-01T00:00:00.000000Z", "2025-01-01T00:00:00.000000Z")
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::DimensionMismatch { expected: 4, actual: 8 }));
}

#[tokio::test]
async fn vectors_round_trip_and_rename() {
    let pool = create_test_pool().await.unwrap();
    let store = VectorStore::new(pool);
    let v = vec![0.25f32, -0.5, 0.75, 1.0];
    store
        .upsert("doc", &v, "s", &tags(&[]), "2025-01-01T00:00:00.000000Z", "2025-01-01T00:00:00.000000Z")
        .await
        .unwrap();

    let out = store.get_vector("doc").await.unwrap().unwrap();
    assert_eq!(out, v);

    assert!(store.rename("doc", "doc@v1").await.unwrap());
    assert!(store.get_vector("doc").await.unwrap().is_none());
    assert_eq!(store.get_vector("doc@v1").await.unwrap().unwrap(), v);
}

#[tokio::test]
async fn delete_for_doc_removes_versions_and_parts() {
    let pool = create_test_pool().await.unwrap();
    let store = VectorStore::new(pool);
    for key in ["doc", "doc@v1", "doc@p1", "docother"] {
        store
            .upsert(key, &unit(0), "s", &tags(&[]), "2025-01-01T00:00:00.000000Z", "2025-01-01T00:00:00.000000Z")
            .await
            .unwrap();
    }
    store.delete_for_doc("doc").await.unwrap();
    assert!(!store.exists("doc").await.unwrap());
    assert!(!store.exists("doc@v1").await.unwrap());
    assert!(!store.exists("doc@p1").await.unwrap());
    assert!(store.exists("docother").await.unwrap());
}
