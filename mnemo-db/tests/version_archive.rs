//! Archival, offset lookup, revert, and extraction on a real database.

use std::collections::BTreeMap;

use mnemo_db::documents::{self, DocumentWrite};
use mnemo_db::edges::EdgeDelta;
use mnemo_db::test_helpers::create_test_pool;
use mnemo_db::versions;

fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn write(id: &str, summary: &str, t: BTreeMap<String, String>) -> DocumentWrite {
    DocumentWrite {
        id: id.to_string(),
        summary: summary.to_string(),
        tags: t,
        content_hash: Some(format!("h-{summary}")),
        content_hash_full: Some(format!("hf-{summary}")),
        created_at_override: None,
    }
}

async fn put_states(pool: &sqlx::SqlitePool, id: &str, summaries: &[&str]) {
    let mut previous = None;
    for (i, s) in summaries.iter().enumerate() {
        let w = write(id, s, tags(&[("step", &i.to_string())]));
        let now = format!("2025-01-0{}T00:00:00.000000Z", i + 1);
        match previous {
            None => {
                documents::insert_document(pool, &w, &EdgeDelta::default(), &now)
                    .await
                    .unwrap();
            }
            Some(prev) => {
                versions_archive(pool, &prev, &w, &now).await;
            }
        }
        previous = documents::get(pool, id).await.unwrap();
    }
}

async fn versions_archive(
    pool: &sqlx::SqlitePool,
    prev: &mnemo_db::DocumentRecord,
    w: &DocumentWrite,
    now: &str,
) {
    documents::update_with_archive(pool, prev, w, &EdgeDelta::default(), now)
        .await
        .unwrap();
}

#[tokio::test]
async fn ordinals_are_dense_and_newest_first() {
    let pool = create_test_pool().await.unwrap();
    put_states(&pool, "doc", &["one", "two", "three", "four"]).await;

    let vs = versions::list_versions(&pool, "doc", 10).await.unwrap();
    let ordinals: Vec<u32> = vs.iter().map(|v| v.ordinal).collect();
    assert_eq!(ordinals, vec![3, 2, 1]);
    assert_eq!(vs[0].summary, "three");
    assert_eq!(vs[2].summary, "one");
}

#[tokio::test]
async fn offset_lookup_matches_rollback_count() {
    let pool = create_test_pool().await.unwrap();
    put_states(&pool, "doc", &["one", "two", "three"]).await;

    let v1 = versions::get_by_offset(&pool, "doc", 1).await.unwrap().unwrap();
    assert_eq!(v1.summary, "two");
    let v2 = versions::get_by_offset(&pool, "doc", 2).await.unwrap().unwrap();
    assert_eq!(v2.summary, "one");
    assert!(versions::get_by_offset(&pool, "doc", 3).await.unwrap().is_none());
}

#[tokio::test]
async fn restore_latest_promotes_and_drops_tail() {
    let pool = create_test_pool().await.unwrap();
    put_states(&pool, "doc", &["one", "two", "three"]).await;

    let promoted = versions::restore_latest(&pool, "doc", "2025-02-01T00:00:00.000000Z")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(promoted.summary, "two");

    let current = documents::get(&pool, "doc").await.unwrap().unwrap();
    assert_eq!(current.summary, "two");
    assert_eq!(versions::max_version(&pool, "doc").await.unwrap(), 1);
}

#[tokio::test]
async fn extract_all_moves_history_and_empties_source() {
    let pool = create_test_pool().await.unwrap();
    put_states(&pool, "now", &["working on auth", "decided OAuth2", "tests green"]).await;

    let result = versions::extract_versions(
        &pool,
        "now",
        "auth-log",
        None,
        false,
        "2025-03-01T00:00:00.000000Z",
    )
    .await
    .unwrap()
    .unwrap();

    assert!(result.source_emptied);
    assert_eq!(result.moved.len(), 3);
    assert!(result.moved.last().unwrap().target_ordinal.is_none());

    let current = documents::get(&pool, "auth-log").await.unwrap().unwrap();
    assert_eq!(current.summary, "tests green");
    let vs = versions::list_versions(&pool, "auth-log", 10).await.unwrap();
    assert_eq!(vs.len(), 2);
    assert_eq!(vs[0].summary, "decided OAuth2");
    assert_eq!(vs[1].summary, "working on auth");

    assert!(documents::get(&pool, "now").await.unwrap().is_none());
}

#[tokio::test]
async fn extract_filtered_keeps_rest_dense() {
    let pool = create_test_pool().await.unwrap();
    // step tags: one=0, two=1, three=2, four=3 (current)
    put_states(&pool, "doc", &["one", "two", "three", "four"]).await;

    let filter = tags(&[("step", "1")]);
    let result = versions::extract_versions(
        &pool,
        "doc",
        "picked",
        Some(&filter),
        false,
        "2025-03-01T00:00:00.000000Z",
    )
    .await
    .unwrap()
    .unwrap();

    assert!(!result.source_emptied);
    assert_eq!(result.moved.len(), 1);
    assert_eq!(result.moved[0].summary, "two");

    // Source keeps its current state and the remaining versions, dense.
    let current = documents::get(&pool, "doc").await.unwrap().unwrap();
    assert_eq!(current.summary, "four");
    let vs = versions::list_versions(&pool, "doc", 10).await.unwrap();
    let ordinals: Vec<u32> = vs.iter().map(|v| v.ordinal).collect();
    assert_eq!(ordinals, vec![2, 1]);
    assert_eq!(vs[0].summary, "three");
    assert_eq!(vs[1].summary, "one");

    let picked = documents::get(&pool, "picked").await.unwrap().unwrap();
    assert_eq!(picked.summary, "two");
}

#[tokio::test]
async fn extract_into_existing_target_archives_its_current() {
    let pool = create_test_pool().await.unwrap();
    put_states(&pool, "src", &["a", "b"]).await;
    put_states(&pool, "dst", &["existing"]).await;

    let result = versions::extract_versions(
        &pool,
        "src",
        "dst",
        None,
        false,
        "2025-03-01T00:00:00.000000Z",
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(result.target_archived_ordinal, Some(1));
    let dst = documents::get(&pool, "dst").await.unwrap().unwrap();
    assert_eq!(dst.summary, "b");
    let vs = versions::list_versions(&pool, "dst", 10).await.unwrap();
    assert_eq!(vs.len(), 2);
    assert_eq!(vs[0].summary, "a");
    assert_eq!(vs[1].summary, "existing");
}

#[tokio::test]
async fn extract_nothing_matches_is_a_noop() {
    let pool = create_test_pool().await.unwrap();
    put_states(&pool, "doc", &["one"]).await;

    let filter = tags(&[("step", "99")]);
    let result = versions::extract_versions(
        &pool,
        "doc",
        "other",
        Some(&filter),
        false,
        "2025-03-01T00:00:00.000000Z",
    )
    .await
    .unwrap();
    assert!(result.is_none());
    assert!(documents::get(&pool, "other").await.unwrap().is_none());
    assert!(documents::get(&pool, "doc").await.unwrap().is_some());
}
