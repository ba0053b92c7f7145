//! Content addressing, tag protection, versioning, revert, delete.

mod common;

use common::{open_engine, tags};
use mnemo_engine::{EngineError, PutRequest};

#[tokio::test]
async fn inline_put_uses_content_address_and_verbatim_summary() {
    let (_tmp, engine) = open_engine().await;

    let item = engine
        .put(PutRequest::content("rate limit is 100 req/min").with_tags(tags(&[("topic", "api")])))
        .await
        .unwrap();

    assert!(item.id.starts_with('%'));
    assert_eq!(item.id.len(), 13);
    assert_eq!(item.summary, "rate limit is 100 req/min");
    assert_eq!(item.source(), Some("inline"));
    assert!(item.content_type().is_none());
    assert_eq!(item.tags.get("topic").map(String::as_str), Some("api"));
    assert_eq!(item.changed, Some(true));
}

#[tokio::test]
async fn same_content_same_id_and_noop() {
    let (_tmp, engine) = open_engine().await;

    let first = engine
        .put(PutRequest::content("a stable thought"))
        .await
        .unwrap();
    let second = engine
        .put(PutRequest::content("a stable thought"))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.changed, Some(false));
    assert!(engine.list_versions(&first.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn tag_change_archives_one_version_and_keeps_vector() {
    let (_tmp, engine) = open_engine().await;

    let first = engine
        .put(PutRequest::content("rate limit is 100 req/min").with_tags(tags(&[("topic", "api")])))
        .await
        .unwrap();
    let vector_before = engine.vectors().get_vector(&first.id).await.unwrap().unwrap();

    let second = engine
        .put(
            PutRequest::content("rate limit is 100 req/min")
                .with_tags(tags(&[("topic", "quota")])),
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.tags.get("topic").map(String::as_str), Some("quota"));

    let versions = engine.list_versions(&first.id, 10).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(
        versions[0].tags.get("topic").map(String::as_str),
        Some("api")
    );

    let vector_after = engine.vectors().get_vector(&first.id).await.unwrap().unwrap();
    assert_eq!(vector_before, vector_after);
}

#[tokio::test]
async fn system_tags_are_stripped_from_user_input() {
    let (_tmp, engine) = open_engine().await;

    let item = engine
        .put(
            PutRequest::content("sneaky")
                .with_tags(tags(&[("topic", "x"), ("_source", "forged"), ("_error", "nope")])),
        )
        .await
        .unwrap();

    assert_eq!(item.source(), Some("inline"));
    assert!(!item.tags.contains_key("_error"));
    assert_eq!(item.tags.get("topic").map(String::as_str), Some("x"));
}

#[tokio::test]
async fn version_ordinals_are_dense_and_offsets_roll_back() {
    let (_tmp, engine) = open_engine().await;

    for content in ["one", "two", "three", "four"] {
        engine
            .put(PutRequest::content(content).with_id("note"))
            .await
            .unwrap();
    }

    let versions = engine.list_versions("note", 10).await.unwrap();
    let ordinals: Vec<&str> = versions
        .iter()
        .map(|v| v.tags.get("_version").unwrap().as_str())
        .collect();
    assert_eq!(ordinals, vec!["3", "2", "1"]);

    // Offset k is the state after k rollbacks.
    let current = engine.get_version("note", 0).await.unwrap().unwrap();
    assert_eq!(current.summary, "four");
    for (offset, expected) in [(1u32, "three"), (2, "two"), (3, "one")] {
        let v = engine.get_version("note", offset).await.unwrap().unwrap();
        assert_eq!(v.summary, expected);
    }
    assert!(engine.get_version("note", 4).await.unwrap().is_none());

    // Suffix addressing resolves the same states.
    let via_suffix = engine.get("note@v2").await.unwrap().unwrap();
    assert_eq!(via_suffix.summary, "two");
}

#[tokio::test]
async fn revert_promotes_previous_and_drops_tail() {
    let (_tmp, engine) = open_engine().await;

    for content in ["one", "two", "three"] {
        engine
            .put(PutRequest::content(content).with_id("note"))
            .await
            .unwrap();
    }

    let restored = engine.revert("note").await.unwrap().unwrap();
    assert_eq!(restored.summary, "two");
    assert_eq!(engine.list_versions("note", 10).await.unwrap().len(), 1);

    // Reverting past the last version deletes the document.
    engine.revert("note").await.unwrap();
    let gone = engine.revert("note").await.unwrap();
    assert!(gone.is_none());
    assert!(engine.get("note").await.unwrap().is_none());
}

#[tokio::test]
async fn delete_removes_document_versions_and_vectors() {
    let (_tmp, engine) = open_engine().await;

    engine.put(PutRequest::content("v1").with_id("doomed")).await.unwrap();
    engine.put(PutRequest::content("v2").with_id("doomed")).await.unwrap();

    assert!(engine.delete("doomed", true).await.unwrap());
    assert!(engine.get("doomed").await.unwrap().is_none());
    assert!(engine.list_versions("doomed", 10).await.unwrap().is_empty());
    assert!(!engine.vectors().exists("doomed").await.unwrap());
    assert!(!engine.delete("doomed", true).await.unwrap());
}

#[tokio::test]
async fn conflicting_inputs_are_rejected() {
    let (_tmp, engine) = open_engine().await;

    let both = engine
        .put(PutRequest {
            content: Some("x".into()),
            uri: Some("file:///tmp/x".into()),
            ..Default::default()
        })
        .await;
    assert!(matches!(both, Err(EngineError::InvalidInput(_))));

    let neither = engine.put(PutRequest::default()).await;
    assert!(matches!(neither, Err(EngineError::InvalidInput(_))));

    let part = engine
        .put(PutRequest::content("x").with_id("doc@p1"))
        .await;
    assert!(matches!(part, Err(EngineError::InvalidInput(_))));
}

#[tokio::test]
async fn get_filtered_hides_mismatches() {
    let (_tmp, engine) = open_engine().await;

    engine
        .put(PutRequest::content("secret").with_id("doc").with_tag("tenant", "alice"))
        .await
        .unwrap();

    let hit = engine
        .get_filtered("doc", &tags(&[("tenant", "alice")]))
        .await
        .unwrap();
    assert!(hit.is_some());

    let miss = engine
        .get_filtered("doc", &tags(&[("tenant", "bob")]))
        .await
        .unwrap();
    assert!(miss.is_none());
}
