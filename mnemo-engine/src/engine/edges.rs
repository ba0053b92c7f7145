//! Edge maintenance on the write path.
//!
//! Edges derive from tags: when `.tag/K` declares `_inverse=V`, a write
//! setting `tags[K]=target` materializes `(source, K, target)`. The
//! delta rides the same transaction as the tag write; targets that do
//! not exist yet are vivified as empty documents afterwards.

use std::collections::BTreeMap;

use mnemo_core::ids::is_system_id;
use mnemo_core::tags::TagMap;
use mnemo_core::time::now_ts;
use mnemo_db::documents::{self, DocumentWrite};
use mnemo_db::edges::{self, EdgeAdd, EdgeDelta};
use mnemo_db::TaskKind;
use tracing::debug;

use crate::engine::{meta, MemoryEngine};
use crate::errors::EngineResult;

/// Compare old and new user tags against the declared edge keys and
/// produce the delta to apply alongside the document write.
pub(crate) fn compute_edge_delta(
    old_tags: &TagMap,
    new_tags: &TagMap,
    edge_keys: &BTreeMap<String, String>,
) -> EdgeDelta {
    let mut delta = EdgeDelta::default();
    for (predicate, inverse) in edge_keys {
        let old_value = old_tags.get(predicate).filter(|v| !v.is_empty());
        let new_value = new_tags.get(predicate).filter(|v| !v.is_empty());
        if old_value == new_value {
            continue;
        }
        if old_value.is_some() {
            delta.removed.push(predicate.clone());
        }
        if let Some(target) = new_value {
            // System docs never become edge targets.
            if !is_system_id(target) {
                delta.added.push(EdgeAdd {
                    predicate: predicate.clone(),
                    target_id: target.clone(),
                    inverse: inverse.clone(),
                });
            }
        }
    }
    delta
}

/// Create empty placeholder documents for edge targets that do not
/// exist yet, marked `_source=auto-vivify`.
pub(crate) async fn vivify_targets(engine: &MemoryEngine, delta: &EdgeDelta) -> EngineResult<()> {
    let pool = engine.pool();
    let now = now_ts();
    for add in &delta.added {
        if documents::exists(pool, &add.target_id).await? {
            continue;
        }
        debug!("auto-vivifying edge target {}", add.target_id);
        let mut tags = TagMap::new();
        tags.insert("_source".into(), "auto-vivify".into());
        let write = DocumentWrite {
            id: add.target_id.clone(),
            summary: String::new(),
            tags,
            content_hash: None,
            content_hash_full: None,
            created_at_override: None,
        };
        documents::insert_document(pool, &write, &EdgeDelta::default(), &now).await?;
    }
    Ok(())
}

/// React to a `.tag/K` doc gaining, losing, or changing `_inverse`.
/// A new declaration enqueues a backfill over existing tags; a removed
/// one drops the predicate's edges.
pub(crate) async fn process_tagdoc_inverse_change(
    engine: &MemoryEngine,
    tagdoc_id: &str,
    old_tags: &TagMap,
    new_tags: &TagMap,
) -> EngineResult<()> {
    let Some(predicate) = tagdoc_id.strip_prefix(".tag/") else {
        return Ok(());
    };
    if predicate.is_empty() || predicate.contains('/') {
        return Ok(());
    }

    let old_inverse = old_tags.get("_inverse").filter(|v| !v.is_empty());
    let new_inverse = new_tags.get("_inverse").filter(|v| !v.is_empty());
    if old_inverse == new_inverse {
        return Ok(());
    }

    let pool = engine.pool();
    match new_inverse {
        Some(inverse) => {
            edges::upsert_backfill(pool, predicate, inverse, None).await?;
            engine
                .queue()
                .enqueue(
                    tagdoc_id,
                    TaskKind::BackfillEdges,
                    &serde_json::json!({ "predicate": predicate, "inverse": inverse }),
                )
                .await?;
        }
        None => {
            edges::delete_edges_for_predicate(pool, predicate).await?;
            edges::delete_backfill(pool, predicate).await?;
        }
    }
    Ok(())
}

/// Materialize edges for every existing document carrying `predicate`.
/// Runs as the `backfill-edges` task.
pub(crate) async fn backfill_edges(
    engine: &MemoryEngine,
    predicate: &str,
    inverse: &str,
) -> EngineResult<u32> {
    let pool = engine.pool();
    let records = documents::query_documents(
        pool,
        &mnemo_db::ListFilter {
            tag_keys: vec![predicate.to_lowercase()],
            include_system: true,
            limit: 0,
            ..Default::default()
        },
        mnemo_db::ListOrder::Updated,
    )
    .await?;

    let now = now_ts();
    let mut count = 0;
    let mut delta = EdgeDelta::default();
    for rec in records {
        if is_system_id(&rec.id) {
            continue;
        }
        let Some(target) = rec
            .tags
            .iter()
            .find(|(k, _)| k.to_lowercase() == predicate.to_lowercase())
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_empty())
        else {
            continue;
        };
        if is_system_id(&target) {
            continue;
        }
        edges::upsert_edge(pool, &rec.id, predicate, &target, inverse, &now).await?;
        delta.added.push(EdgeAdd {
            predicate: predicate.to_string(),
            target_id: target,
            inverse: inverse.to_string(),
        });
        count += 1;
    }
    vivify_targets(engine, &delta).await?;
    edges::upsert_backfill(pool, predicate, inverse, Some(&now)).await?;
    Ok(count)
}

/// The edge-key map for a write, with the quirk that the write being
/// processed may itself be the declaring tagdoc.
pub(crate) async fn current_edge_keys(
    engine: &MemoryEngine,
) -> EngineResult<BTreeMap<String, String>> {
    meta::edge_keys(engine.pool()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn keys(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn value_change_swaps_the_edge() {
        let delta = compute_edge_delta(
            &tags(&[("speaker", "alice")]),
            &tags(&[("speaker", "bob")]),
            &keys(&[("speaker", "said")]),
        );
        assert_eq!(delta.removed, vec!["speaker"]);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].target_id, "bob");
        assert_eq!(delta.added[0].inverse, "said");
    }

    #[test]
    fn removal_deletes_without_adding() {
        let delta = compute_edge_delta(
            &tags(&[("speaker", "alice")]),
            &tags(&[]),
            &keys(&[("speaker", "said")]),
        );
        assert_eq!(delta.removed, vec!["speaker"]);
        assert!(delta.added.is_empty());
    }

    #[test]
    fn non_edge_keys_are_ignored() {
        let delta = compute_edge_delta(
            &tags(&[]),
            &tags(&[("topic", "ai")]),
            &keys(&[("speaker", "said")]),
        );
        assert!(delta.is_empty());
    }

    #[test]
    fn system_targets_never_edge() {
        let delta = compute_edge_delta(
            &tags(&[]),
            &tags(&[("speaker", ".meta/todo")]),
            &keys(&[("speaker", "said")]),
        );
        assert!(delta.added.is_empty());
    }

    #[test]
    fn unchanged_value_is_noop() {
        let delta = compute_edge_delta(
            &tags(&[("speaker", "alice")]),
            &tags(&[("speaker", "alice")]),
            &keys(&[("speaker", "said")]),
        );
        assert!(delta.is_empty());
    }
}
