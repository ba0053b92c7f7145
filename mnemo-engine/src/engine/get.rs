//! The read protocol: id dispatch, tag-filter gate, and context
//! assembly (similar, meta, inverse edges, version nav, parts).

use std::collections::{BTreeMap, BTreeSet};

use mnemo_core::ids::{is_system_id, validate_id, EntityKey};
use mnemo_core::tags::TagMap;
use mnemo_core::time::{date_of, now_ts, utc_now};

use mnemo_db::{documents, edges as db_edges, parts, versions};

use crate::decay::decay_factor;
use crate::engine::{meta, MemoryEngine};
use crate::errors::EngineResult;
use crate::models::{
    part_to_item, record_to_item, version_to_item, EdgeRef, Item, ItemContext, MetaRef, PartRef,
    SimilarRef, VersionRef,
};

pub(crate) async fn get(engine: &MemoryEngine, id: &str) -> EngineResult<Option<Item>> {
    validate_id(id)?;
    match EntityKey::parse(id) {
        EntityKey::Doc(doc_id) => get_doc(engine, &doc_id).await,
        // The @v suffix addresses by offset: @v0 is current, @v1 the
        // newest archived state.
        EntityKey::Version { doc_id, ordinal } => get_version(engine, &doc_id, ordinal).await,
        EntityKey::Part { doc_id, part_num } => get_part(engine, &doc_id, part_num).await,
    }
}

async fn get_doc(engine: &MemoryEngine, id: &str) -> EngineResult<Option<Item>> {
    let Some(record) = documents::get(engine.pool(), id).await? else {
        return Ok(None);
    };
    documents::touch(engine.pool(), id, &now_ts()).await?;
    Ok(Some(record_to_item(&record, None, None)))
}

/// Like `get`, but a tag mismatch reads as not-found. Tags are the
/// tenant boundary, so a filtered reader must not learn the doc exists.
pub(crate) async fn get_filtered(
    engine: &MemoryEngine,
    id: &str,
    tags: &TagMap,
) -> EngineResult<Option<Item>> {
    let Some(item) = get(engine, id).await? else {
        return Ok(None);
    };
    for (key, value) in tags {
        let stored = item.tags.get(&key.to_lowercase());
        let matches = match value.as_str() {
            "*" => stored.is_some(),
            v => stored.is_some_and(|s| s.eq_ignore_ascii_case(v)),
        };
        if !matches {
            return Ok(None);
        }
    }
    Ok(Some(item))
}

pub(crate) async fn get_version(
    engine: &MemoryEngine,
    id: &str,
    offset: u32,
) -> EngineResult<Option<Item>> {
    validate_id(id)?;
    if offset == 0 {
        return get_doc(engine, id).await;
    }
    let version = versions::get_by_offset(engine.pool(), id, offset).await?;
    Ok(version.map(|v| version_to_item(id, &v)))
}

pub(crate) async fn list_versions(
    engine: &MemoryEngine,
    id: &str,
    limit: usize,
) -> EngineResult<Vec<Item>> {
    validate_id(id)?;
    let versions = versions::list_versions(engine.pool(), id, limit).await?;
    Ok(versions.iter().map(|v| version_to_item(id, v)).collect())
}

pub(crate) async fn get_part(
    engine: &MemoryEngine,
    id: &str,
    part_num: u32,
) -> EngineResult<Option<Item>> {
    let Some(part) = parts::get_part(engine.pool(), id, part_num).await? else {
        return Ok(None);
    };
    let total = parts::part_count(engine.pool(), id).await?;
    Ok(Some(part_to_item(id, &part, total)))
}

pub(crate) async fn list_parts(engine: &MemoryEngine, id: &str) -> EngineResult<Vec<PartRef>> {
    let parts = parts::list_parts(engine.pool(), id).await?;
    Ok(parts
        .into_iter()
        .map(|p| PartRef {
            part_num: p.part_num,
            summary: p.summary,
            tags: p.tags,
        })
        .collect())
}

/// Assemble the display context for one item.
pub(crate) async fn get_context(
    engine: &MemoryEngine,
    id: &str,
    version: Option<u32>,
) -> EngineResult<Option<ItemContext>> {
    validate_id(id)?;
    let offset = version.unwrap_or(0);
    let Some(item) = get_version(engine, id, offset).await? else {
        return Ok(None);
    };

    // Version navigation: up to 3 older states, and newer ones when
    // viewing an archived offset.
    let mut prev = Vec::new();
    let mut next = Vec::new();
    let history = versions::list_versions(engine.pool(), id, 1000).await?;
    let total = history.len() as u32;
    for i in 0..3u32 {
        let o = offset + i + 1;
        if o > total {
            break;
        }
        if let Some(v) = versions::get_by_offset(engine.pool(), id, o).await? {
            prev.push(VersionRef {
                offset: o,
                date: date_of(&v.created_at),
                summary: v.summary,
            });
        }
    }
    if offset > 0 {
        for i in 0..3u32 {
            if offset <= i + 1 {
                // Offset 0 is the current state, listed via its record.
                if let Some(rec) = documents::get(engine.pool(), id).await? {
                    next.push(VersionRef {
                        offset: 0,
                        date: date_of(&rec.updated_at),
                        summary: rec.summary,
                    });
                }
                break;
            }
            let o = offset - i - 1;
            if let Some(v) = versions::get_by_offset(engine.pool(), id, o).await? {
                next.push(VersionRef {
                    offset: o,
                    date: date_of(&v.created_at),
                    summary: v.summary,
                });
            }
        }
    }

    // Blocks below only apply when viewing the current state.
    let mut similar = Vec::new();
    let mut meta_refs = BTreeMap::new();
    let mut edge_refs: BTreeMap<String, Vec<EdgeRef>> = BTreeMap::new();
    let mut part_refs = Vec::new();

    if offset == 0 {
        similar = similar_for_display(engine, id, 3).await?;

        for (name, items) in meta::resolve_meta(engine, id, &item.tags, 3).await? {
            meta_refs.insert(
                name,
                items
                    .into_iter()
                    .map(|i| MetaRef {
                        id: i.id,
                        summary: i.summary,
                    })
                    .collect(),
            );
        }

        for edge in db_edges::get_inverse_edges(engine.pool(), id).await? {
            let summary = documents::get(engine.pool(), &edge.source_id)
                .await?
                .map(|d| d.summary)
                .unwrap_or_default();
            edge_refs.entry(edge.inverse.clone()).or_default().push(EdgeRef {
                source_id: edge.source_id,
                summary,
                date: date_of(&edge.created_at),
            });
        }

        part_refs = list_parts(engine, id).await?;
    }

    let focus_part = item
        .tags
        .get("_focus_part")
        .and_then(|v| v.parse::<u32>().ok());

    Ok(Some(ItemContext {
        item,
        viewing_offset: offset,
        similar,
        meta: meta_refs,
        edges: edge_refs,
        parts: part_refs,
        focus_part,
        prev,
        next,
    }))
}

/// Similar items for frontmatter display: stored embedding, one hit per
/// base document, source and system docs excluded.
pub(crate) async fn similar_for_display(
    engine: &MemoryEngine,
    id: &str,
    limit: usize,
) -> EngineResult<Vec<SimilarRef>> {
    let hits = engine
        .vectors()
        .query_by_key(id, &Default::default(), limit * 5)
        .await?;

    let now = utc_now();
    let half_life = engine.settings().decay_half_life_days;
    let source_base = EntityKey::parse(id).doc_id().to_string();

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut result = Vec::new();
    for hit in hits {
        let key = EntityKey::parse(&hit.key);
        let base_id = key.doc_id().to_string();
        if base_id == source_base || is_system_id(&base_id) {
            continue;
        }
        if !seen.insert(base_id.clone()) {
            continue;
        }
        let offset = match &key {
            EntityKey::Version { ordinal, .. } => {
                let max = versions::max_version(engine.pool(), &base_id).await?;
                max.saturating_sub(*ordinal) + 1
            }
            _ => 0,
        };
        let score = hit.similarity * decay_factor(&hit.updated_at, now, half_life);
        result.push(SimilarRef {
            id: base_id,
            offset,
            score: Some(score),
            date: date_of(&hit.updated_at),
            summary: hit.summary,
        });
        if result.len() >= limit {
            break;
        }
    }
    result.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(result)
}
