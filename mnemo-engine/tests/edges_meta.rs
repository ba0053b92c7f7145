//! Tag-driven edges, auto-vivification, constrained tags, and meta
//! resolution.

mod common;

use common::{declare_edge_key, open_engine, tags};
use mnemo_engine::{EngineError, PutRequest};

#[tokio::test]
async fn edge_created_on_put_and_target_vivified() {
    let (_tmp, engine) = open_engine().await;
    declare_edge_key(&engine, "speaker", "said").await;

    assert!(engine.get("Kate").await.unwrap().is_none());

    engine
        .put(PutRequest::content("turn A").with_id("conv1").with_tag("speaker", "Kate"))
        .await
        .unwrap();
    engine
        .put(PutRequest::content("turn B").with_id("conv2").with_tag("speaker", "Kate"))
        .await
        .unwrap();

    let kate = engine.get("Kate").await.unwrap().unwrap();
    assert_eq!(kate.source(), Some("auto-vivify"));

    let ctx = engine.get_context("Kate", None).await.unwrap().unwrap();
    let said = ctx.edges.get("said").expect("said block");
    assert_eq!(said.len(), 2);
    let sources: Vec<&str> = said.iter().map(|e| e.source_id.as_str()).collect();
    assert!(sources.contains(&"conv1"));
    assert!(sources.contains(&"conv2"));
}

#[tokio::test]
async fn tag_value_change_moves_the_edge() {
    let (_tmp, engine) = open_engine().await;
    declare_edge_key(&engine, "speaker", "said").await;

    engine
        .put(PutRequest::content("hello").with_id("conv1").with_tag("speaker", "alice"))
        .await
        .unwrap();
    engine.tag("conv1", &tags(&[("speaker", "bob")])).await.unwrap();

    let alice = engine.get_context("alice", None).await.unwrap().unwrap();
    assert!(alice.edges.get("said").map_or(true, Vec::is_empty));

    let bob = engine.get_context("bob", None).await.unwrap().unwrap();
    assert_eq!(bob.edges.get("said").unwrap().len(), 1);
}

#[tokio::test]
async fn removing_tag_removes_edge_but_preserves_other_predicates() {
    let (_tmp, engine) = open_engine().await;
    declare_edge_key(&engine, "speaker", "said").await;
    declare_edge_key(&engine, "location", "visited_by").await;

    engine
        .put(
            PutRequest::content("meeting notes")
                .with_id("conv1")
                .with_tag("speaker", "alice")
                .with_tag("location", "office"),
        )
        .await
        .unwrap();

    engine.tag("conv1", &tags(&[("speaker", "")])).await.unwrap();

    let alice = engine.get_context("alice", None).await.unwrap().unwrap();
    assert!(alice.edges.get("said").map_or(true, Vec::is_empty));
    let office = engine.get_context("office", None).await.unwrap().unwrap();
    assert_eq!(office.edges.get("visited_by").unwrap().len(), 1);
}

#[tokio::test]
async fn deleting_source_or_target_cleans_edges() {
    let (_tmp, engine) = open_engine().await;
    declare_edge_key(&engine, "speaker", "said").await;

    engine
        .put(PutRequest::content("hi").with_id("conv1").with_tag("speaker", "nate"))
        .await
        .unwrap();
    engine.delete("conv1", true).await.unwrap();
    let ctx = engine.get_context("nate", None).await.unwrap().unwrap();
    assert!(ctx.edges.get("said").map_or(true, Vec::is_empty));

    engine
        .put(PutRequest::content("hi again").with_id("conv2").with_tag("speaker", "nate"))
        .await
        .unwrap();
    engine.delete("nate", true).await.unwrap();
    engine.put(PutRequest::content("empty").with_id("nate")).await.unwrap();
    let ctx = engine.get_context("nate", None).await.unwrap().unwrap();
    assert!(ctx.edges.get("said").map_or(true, Vec::is_empty));
}

#[tokio::test]
async fn system_doc_targets_never_edge() {
    let (_tmp, engine) = open_engine().await;
    declare_edge_key(&engine, "speaker", "said").await;

    engine
        .put(PutRequest::content("ref").with_id("doc1").with_tag("speaker", ".meta/todo"))
        .await
        .unwrap();

    let edges = mnemo_db::edges::get_inverse_edges(engine.pool(), ".meta/todo")
        .await
        .unwrap();
    assert!(edges.is_empty());
}

#[tokio::test]
async fn no_edge_without_inverse_declaration() {
    let (_tmp, engine) = open_engine().await;

    engine
        .put(PutRequest::content("doc").with_id("doc1").with_tag("subject", "ai"))
        .await
        .unwrap();
    engine.put(PutRequest::content("the topic").with_id("ai")).await.unwrap();

    let ctx = engine.get_context("ai", None).await.unwrap().unwrap();
    assert!(ctx.edges.is_empty());
}

// ── Constrained tags (S5) ───────────────────────────────────────────

#[tokio::test]
async fn constrained_tag_accepts_listed_values_only() {
    let (_tmp, engine) = open_engine().await;

    // .tag/act ships constrained with six speech acts.
    let ok = engine
        .put(PutRequest::content("I'll fix it").with_tag("act", "commitment"))
        .await;
    assert!(ok.is_ok());

    let err = engine
        .put(PutRequest::content("I'll fix it later").with_tag("act", "blurb"))
        .await
        .unwrap_err();
    match err {
        EngineError::TagConstraint { key, value, valid } => {
            assert_eq!(key, "act");
            assert_eq!(value, "blurb");
            for expected in ["commitment", "request", "offer", "assertion", "assessment", "declaration"] {
                assert!(valid.contains(&expected.to_string()), "missing {expected}");
            }
        }
        other => panic!("expected TagConstraint, got {other:?}"),
    }

    // Deleting a constrained tag is always allowed.
    let item = engine
        .put(PutRequest::content("I'll fix it").with_tag("act", "commitment"))
        .await
        .unwrap();
    engine.tag(&item.id, &tags(&[("act", "")])).await.unwrap();
}

#[tokio::test]
async fn unconstrained_keys_accept_anything() {
    let (_tmp, engine) = open_engine().await;
    let item = engine
        .put(PutRequest::content("free tagging").with_tag("project", "whatever-i-like"))
        .await
        .unwrap();
    assert_eq!(
        item.tags.get("project").map(String::as_str),
        Some("whatever-i-like")
    );
}

// ── Meta resolution ─────────────────────────────────────────────────

#[tokio::test]
async fn meta_todo_surfaces_open_commitments() {
    let (_tmp, engine) = open_engine().await;

    engine
        .put(
            PutRequest::content("I'll ship the login fix")
                .with_id("todo1")
                .with_tag("act", "commitment")
                .with_tag("status", "open"),
        )
        .await
        .unwrap();
    engine
        .put(
            PutRequest::content("Done months ago")
                .with_id("done1")
                .with_tag("act", "commitment")
                .with_tag("status", "fulfilled"),
        )
        .await
        .unwrap();

    let anchor = engine
        .put(PutRequest::content("thinking about the login work").with_id("anchor"))
        .await
        .unwrap();

    let ctx = engine.get_context(&anchor.id, None).await.unwrap().unwrap();
    let todo = ctx.meta.get("todo").expect("todo block");
    let ids: Vec<&str> = todo.iter().map(|m| m.id.as_str()).collect();
    assert!(ids.contains(&"todo1"));
    assert!(!ids.contains(&"done1"));
}

#[tokio::test]
async fn meta_prerequisite_gates_the_query() {
    let (_tmp, engine) = open_engine().await;

    // A meta doc that only fires for documents carrying `project`.
    engine
        .put(PutRequest::content("status=open\nproject=*").with_id(".meta/projwork"))
        .await
        .unwrap();
    engine
        .put(
            PutRequest::content("an open item")
                .with_id("item1")
                .with_tag("status", "open"),
        )
        .await
        .unwrap();

    let without = engine
        .put(PutRequest::content("no project here").with_id("plain"))
        .await
        .unwrap();
    let ctx = engine.get_context(&without.id, None).await.unwrap().unwrap();
    assert!(!ctx.meta.contains_key("projwork"));

    let with = engine
        .put(
            PutRequest::content("within a project")
                .with_id("proj-doc")
                .with_tag("project", "auth"),
        )
        .await
        .unwrap();
    let ctx = engine.get_context(&with.id, None).await.unwrap().unwrap();
    let block = ctx.meta.get("projwork").expect("projwork block");
    assert!(block.iter().any(|m| m.id == "item1"));
}
