//! The nowdoc singleton and history relocation.

mod common;

use common::{open_engine, tags};
use mnemo_engine::{EngineError, PutRequest};

#[tokio::test]
async fn get_now_auto_creates_from_default() {
    let (_tmp, engine) = open_engine().await;

    let now = engine.get_now(None).await.unwrap();
    assert_eq!(now.id, "now");
    assert!(now.summary.contains("working on"));

    // Scoped nowdocs are independent singletons.
    let scoped = engine.get_now(Some("alice")).await.unwrap();
    assert_eq!(scoped.id, "now:alice");
    assert_eq!(scoped.tags.get("user").map(String::as_str), Some("alice"));
}

#[tokio::test]
async fn set_now_archives_the_trail() {
    let (_tmp, engine) = open_engine().await;

    engine.set_now("working on auth", None, None).await.unwrap();
    engine.set_now("decided OAuth2", None, None).await.unwrap();
    let now = engine.set_now("tests green", None, None).await.unwrap();

    assert_eq!(now.summary, "tests green");
    let versions = engine.list_versions("now", 10).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].summary, "decided OAuth2");
    assert_eq!(versions[1].summary, "working on auth");
}

#[tokio::test]
async fn move_relocates_the_full_trail_and_resets_now() {
    let (_tmp, engine) = open_engine().await;

    engine.set_now("working on auth", None, None).await.unwrap();
    engine.set_now("decided OAuth2", None, None).await.unwrap();
    engine.set_now("tests green", None, None).await.unwrap();

    let moved = engine
        .move_versions("auth-log", "now", None, false)
        .await
        .unwrap();
    assert_eq!(moved, 3);

    let log = engine.get("auth-log").await.unwrap().unwrap();
    assert_eq!(log.summary, "tests green");
    assert_eq!(log.tags.get("_saved_from").map(String::as_str), Some("now"));
    let versions = engine.list_versions("auth-log", 10).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].summary, "decided OAuth2");
    assert_eq!(versions[1].summary, "working on auth");

    // The drained nowdoc reset to the bundled default.
    let now = engine.get_now(None).await.unwrap();
    assert!(now.summary.contains("working on right now"));

    // Embeddings moved with their states.
    assert!(engine.vectors().get_vector("auth-log").await.unwrap().is_some());
}

#[tokio::test]
async fn move_with_filter_takes_matching_versions_only() {
    let (_tmp, engine) = open_engine().await;

    engine
        .put(PutRequest::content("auth: wrote middleware").with_id("now").with_tag("project", "auth"))
        .await
        .unwrap();
    engine
        .put(PutRequest::content("billing: fixed invoice rounding").with_id("now").with_tag("project", "billing"))
        .await
        .unwrap();
    engine
        .put(PutRequest::content("auth: shipped login").with_id("now").with_tag("project", "auth"))
        .await
        .unwrap();

    let moved = engine
        .move_versions("auth-log", "now", Some(&tags(&[("project", "auth")])), false)
        .await
        .unwrap();
    assert_eq!(moved, 2);

    let log = engine.get("auth-log").await.unwrap().unwrap();
    assert_eq!(log.summary, "auth: shipped login");

    // The non-matching state stays behind as the source's current.
    let now = engine.get("now").await.unwrap().unwrap();
    assert_eq!(now.summary, "billing: fixed invoice rounding");
}

#[tokio::test]
async fn move_into_existing_target_extends_history() {
    let (_tmp, engine) = open_engine().await;

    engine.put(PutRequest::content("original entry").with_id("log")).await.unwrap();
    engine.set_now("new thread", None, None).await.unwrap();

    let moved = engine.move_versions("log", "now", None, false).await.unwrap();
    assert_eq!(moved, 1);

    let log = engine.get("log").await.unwrap().unwrap();
    assert_eq!(log.summary, "new thread");
    let versions = engine.list_versions("log", 10).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].summary, "original entry");
}

#[tokio::test]
async fn move_errors_when_nothing_matches() {
    let (_tmp, engine) = open_engine().await;

    engine.set_now("some work", None, None).await.unwrap();
    let err = engine
        .move_versions("out", "now", Some(&tags(&[("project", "nope")])), false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let missing = engine
        .move_versions("out", "ghost-source", None, false)
        .await
        .unwrap_err();
    assert!(matches!(missing, EngineError::NotFound(_)));
}
