//! The retrieval pipeline: semantic / lexical / similar-to search with
//! tag pre-filter, time window, recency decay, part uplift, and the
//! deep expansion under a token budget.

use std::collections::{BTreeSet, VecDeque};

use mnemo_core::ids::{is_system_id, EntityKey};
use mnemo_core::tags::{validate_tag_key, TagMap};
use mnemo_core::time::{format_ts, now_ts, parse_when, utc_now};

use mnemo_db::documents::{self, ListFilter, ListOrder};
use mnemo_db::{edges as db_edges, VectorFilter};

use crate::decay::decay_factor;
use crate::engine::MemoryEngine;
use crate::errors::{EngineError, EngineResult};
use crate::models::{record_to_item, DeepItem, FindRequest, Item};

const MAX_CANDIDATES: usize = 200;
const DEEP_MAX_DEPTH: u8 = 2;
/// Token budget approximation: characters per token.
const CHARS_PER_TOKEN: usize = 4;

pub(crate) async fn find(engine: &MemoryEngine, request: FindRequest) -> EngineResult<Vec<Item>> {
    if request.query.is_some() && request.similar_to.is_some() {
        return Err(EngineError::InvalidInput(
            "specify either query or similar_to, not both".into(),
        ));
    }
    if request.query.is_none() && request.similar_to.is_none() {
        return Err(EngineError::InvalidInput(
            "specify either query or similar_to".into(),
        ));
    }
    if request.fulltext && request.similar_to.is_some() {
        return Err(EngineError::InvalidInput(
            "fulltext cannot be used with similar_to".into(),
        ));
    }

    let now = utc_now();
    let since = request
        .since
        .as_deref()
        .map(|s| parse_when(s, now).map(format_ts))
        .transpose()?;
    let until = request
        .until
        .as_deref()
        .map(|s| parse_when(s, now).map(format_ts))
        .transpose()?;

    // Lexical path: the substring index, ranked by recency.
    if request.fulltext {
        let needle = request.query.as_deref().unwrap_or_default();
        let records = documents::fulltext_search(
            engine.pool(),
            needle,
            request.include_system,
            request.limit * 3,
        )
        .await?;
        let mut items: Vec<Item> = records
            .iter()
            .filter(|r| tag_filter_matches(&r.tags, &request.tags))
            .filter(|r| window_matches(&r.updated_at, &since, &until))
            .map(|r| record_to_item(r, None, None))
            .collect();
        items.truncate(request.limit);
        touch_results(engine, &items).await?;
        return Ok(items);
    }

    // Semantic paths share the vector pre-filter.
    let filter = VectorFilter {
        tags: request
            .tags
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
            .collect(),
        since,
        until,
        include_pending: false,
    };
    let fetch_limit = (request.limit * 4).min(MAX_CANDIDATES).max(1);

    let hits = match (&request.query, &request.similar_to) {
        (Some(query), None) => {
            for key in request.tags.keys() {
                validate_tag_key(key)?;
            }
            let vector = engine.providers().embed(engine.pool(), query).await?;
            engine.vectors().query(&vector, &filter, fetch_limit).await?
        }
        (None, Some(anchor)) => {
            let hits = engine
                .vectors()
                .query_by_key(anchor, &filter, fetch_limit + 1)
                .await?;
            if hits.is_empty() && !engine.vectors().exists(anchor).await? {
                return Err(EngineError::NotFound(anchor.clone()));
            }
            hits
        }
        _ => unreachable!(),
    };

    let half_life = engine.settings().decay_half_life_days;
    let mut scored: Vec<(f32, Item)> = Vec::new();
    for hit in hits {
        if let (Some(anchor), false) = (&request.similar_to, request.include_self) {
            if hit.key == *anchor {
                continue;
            }
        }
        let base_id = EntityKey::parse(&hit.key).doc_id().to_string();
        if !request.include_system && is_system_id(&base_id) {
            continue;
        }
        let effective = hit.similarity * decay_factor(&hit.updated_at, now, half_life);
        let item = Item {
            id: hit.key.clone(),
            summary: hit.summary,
            tags: hit.tags,
            score: Some(hit.similarity),
            changed: None,
        };
        scored.push((effective, item));
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    // Part-to-parent uplift: a part hit surfaces its parent document,
    // carrying `_focus_part` so renderers can window the manifest.
    // Version hits collapse onto their base document too; the first
    // (highest-scoring) hit per parent wins.
    let mut uplifted: Vec<Item> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for (_, item) in scored {
        match EntityKey::parse(&item.id) {
            EntityKey::Doc(id) => {
                if seen.insert(id.clone()) {
                    uplifted.push(item);
                }
            }
            EntityKey::Version { doc_id, .. } => {
                if seen.insert(doc_id.clone()) {
                    uplifted.push(Item {
                        id: doc_id,
                        ..item
                    });
                }
            }
            EntityKey::Part { doc_id, part_num } => {
                if !seen.insert(doc_id.clone()) {
                    continue;
                }
                match documents::get(engine.pool(), &doc_id).await? {
                    Some(parent) => {
                        let mut parent_item = record_to_item(&parent, item.score, None);
                        parent_item
                            .tags
                            .insert("_focus_part".into(), part_num.to_string());
                        uplifted.push(parent_item);
                    }
                    None => uplifted.push(item),
                }
            }
        }
        if uplifted.len() >= request.limit {
            break;
        }
    }

    // Enrich from the document store: the index carries casefolded
    // values, the canonical display tags live in the documents table.
    let mut final_items = Vec::with_capacity(uplifted.len());
    for item in uplifted {
        match documents::get(engine.pool(), &item.id).await? {
            Some(rec) => {
                let mut enriched = record_to_item(&rec, item.score, None);
                if let Some(focus) = item.tags.get("_focus_part") {
                    enriched.tags.insert("_focus_part".into(), focus.clone());
                }
                final_items.push(enriched);
            }
            None => final_items.push(item),
        }
    }

    touch_results(engine, &final_items).await?;
    Ok(final_items)
}

async fn touch_results(engine: &MemoryEngine, items: &[Item]) -> EngineResult<()> {
    if items.is_empty() {
        return Ok(());
    }
    let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
    documents::touch_many(engine.pool(), &ids, &now_ts()).await?;
    Ok(())
}

fn tag_filter_matches(tags: &TagMap, filter: &TagMap) -> bool {
    filter.iter().all(|(k, v)| {
        let stored = tags
            .iter()
            .find(|(tk, _)| tk.to_lowercase() == k.to_lowercase())
            .map(|(_, tv)| tv);
        match v.as_str() {
            "*" => stored.is_some(),
            v => stored.is_some_and(|s| s.eq_ignore_ascii_case(v)),
        }
    })
}

fn window_matches(updated_at: &str, since: &Option<String>, until: &Option<String>) -> bool {
    if let Some(since) = since {
        if updated_at < since.as_str() {
            return false;
        }
    }
    if let Some(until) = until {
        if updated_at >= until.as_str() {
            return false;
        }
    }
    true
}

// ── Deep expansion ──────────────────────────────────────────────────

/// `find`, then a breadth-first walk over outbound edges and similar
/// items, trimmed to a token budget (approximated as chars / 4).
pub(crate) async fn find_deep(
    engine: &MemoryEngine,
    request: FindRequest,
    token_budget: usize,
) -> EngineResult<Vec<DeepItem>> {
    let seeds = find(engine, request).await?;

    let mut budget = token_budget.saturating_mul(CHARS_PER_TOKEN);
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<(String, u8, String)> = VecDeque::new();
    let mut result: Vec<DeepItem> = Vec::new();

    for seed in seeds {
        let cost = seed.summary.len();
        if cost > budget {
            break;
        }
        budget -= cost;
        visited.insert(seed.id.clone());
        queue.push_back((seed.id.clone(), 0, "hit".to_string()));
        result.push(DeepItem {
            item: seed,
            depth: 0,
            relation: "hit".into(),
        });
    }

    while let Some((id, depth, _)) = queue.pop_front() {
        if depth >= DEEP_MAX_DEPTH || budget == 0 {
            continue;
        }

        let mut neighbors: Vec<(String, String)> = Vec::new();
        for edge in db_edges::list_edges_for_source(engine.pool(), &id).await? {
            neighbors.push((edge.target_id, format!("edge:{}", edge.predicate)));
        }
        for similar in crate::engine::get::similar_for_display(engine, &id, 3).await? {
            neighbors.push((similar.id, "similar".to_string()));
        }

        for (neighbor, relation) in neighbors {
            if !visited.insert(neighbor.clone()) {
                continue;
            }
            let Some(rec) = documents::get(engine.pool(), &neighbor).await? else {
                continue;
            };
            let cost = rec.summary.len();
            if cost > budget {
                return Ok(result);
            }
            budget -= cost;
            queue.push_back((neighbor.clone(), depth + 1, relation.clone()));
            result.push(DeepItem {
                item: record_to_item(&rec, None, None),
                depth: depth + 1,
                relation,
            });
        }
    }

    Ok(result)
}

// ── Listing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ListItemsRequest {
    pub prefix: Option<String>,
    pub tags: TagMap,
    pub tag_keys: Vec<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub order_by_accessed: bool,
    pub include_system: bool,
    pub limit: usize,
}

pub(crate) async fn list_items(
    engine: &MemoryEngine,
    request: ListItemsRequest,
) -> EngineResult<Vec<Item>> {
    let now = utc_now();
    let since = request
        .since
        .as_deref()
        .map(|s| parse_when(s, now).map(format_ts))
        .transpose()?;
    let until = request
        .until
        .as_deref()
        .map(|s| parse_when(s, now).map(format_ts))
        .transpose()?;

    let mut folded_tags = TagMap::new();
    for (key, value) in &request.tags {
        validate_tag_key(key)?;
        folded_tags.insert(key.to_lowercase(), value.to_lowercase());
    }
    let mut folded_keys = Vec::new();
    for key in &request.tag_keys {
        validate_tag_key(key)?;
        folded_keys.push(key.to_lowercase());
    }

    let limit = if request.limit == 0 { 10 } else { request.limit };
    let records = documents::query_documents(
        engine.pool(),
        &ListFilter {
            prefix: request.prefix.clone(),
            tags: folded_tags,
            tag_keys: folded_keys,
            since,
            until,
            include_system: request.include_system || request.prefix.as_deref().is_some_and(is_system_id),
            limit,
        },
        if request.order_by_accessed {
            ListOrder::Accessed
        } else {
            ListOrder::Updated
        },
    )
    .await?;

    Ok(records.iter().map(|r| record_to_item(r, None, None)).collect())
}

pub(crate) async fn list_tags(
    engine: &MemoryEngine,
    key: Option<&str>,
) -> EngineResult<Vec<String>> {
    match key {
        Some(key) => {
            validate_tag_key(key)?;
            Ok(documents::list_distinct_tag_values(engine.pool(), &key.to_lowercase()).await?)
        }
        None => Ok(documents::list_distinct_tag_keys(engine.pool()).await?),
    }
}
