//! Meta-doc resolution, constrained tags, and prompt selection.
//!
//! Three families of user-editable system documents steer the engine:
//!
//! - `.tag/K` describes tag key K. `_constrained=true` restricts values
//!   to the `.tag/K/*` children; `_inverse=V` declares K as an edge key.
//! - `.meta/NAME` holds a small tag-query DSL, evaluated at read time
//!   against the current document's tags.
//! - `.prompt/{summarize,analyze}/NAME` overrides the default prompt
//!   when its match rules fit the document.

use std::collections::{BTreeMap, BTreeSet};

use mnemo_core::tags::{is_system_key, TagMap};
use sqlx::SqlitePool;

use mnemo_db::documents::{self, ListFilter, ListOrder};

use crate::engine::MemoryEngine;
use crate::errors::{EngineError, EngineResult};
use crate::models::{record_to_item, Item};

/// Parsed body of a meta doc.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaQuery {
    /// Each line is an AND set; lines OR together.
    pub query_lines: Vec<TagMap>,
    /// `key=` lines: value filled from the current doc's tags.
    pub context_keys: Vec<String>,
    /// `key=*` lines: skip the meta doc if the current doc lacks key.
    pub prereq_keys: Vec<String>,
}

fn is_meta_key(token: &str) -> bool {
    let mut chars = token.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse meta-doc content. Lines that do not fit the DSL are prose and
/// ignored.
pub fn parse_meta_doc(content: &str) -> MetaQuery {
    let mut parsed = MetaQuery::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(key) = line.strip_suffix("=*") {
            if is_meta_key(key) {
                parsed.prereq_keys.push(key.to_string());
                continue;
            }
        }
        if let Some(key) = line.strip_suffix('=') {
            if is_meta_key(key) && !line.contains(' ') {
                parsed.context_keys.push(key.to_string());
                continue;
            }
        }

        let mut pairs = TagMap::new();
        let mut is_query = true;
        for token in line.split_whitespace() {
            match token.split_once('=') {
                Some((k, v)) if is_meta_key(k) && !v.is_empty() => {
                    pairs.insert(k.to_string(), v.to_string());
                }
                _ => {
                    is_query = false;
                    break;
                }
            }
        }
        if is_query && !pairs.is_empty() {
            parsed.query_lines.push(pairs);
        }
    }

    parsed
}

/// Resolve every applicable `.meta/*` doc against an item's tags.
/// Returns meta short-name → matched items; empty results omitted.
pub(crate) async fn resolve_meta(
    engine: &MemoryEngine,
    item_id: &str,
    current_tags: &TagMap,
    limit_per_doc: usize,
) -> EngineResult<BTreeMap<String, Vec<Item>>> {
    let pool = engine.pool();
    let meta_docs = documents::query_by_id_prefix(pool, ".meta/").await?;
    let mut result = BTreeMap::new();

    for doc in meta_docs {
        let short_name = doc
            .id
            .split_once('/')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_else(|| doc.id.clone());

        let parsed = parse_meta_doc(&doc.summary);
        if parsed.query_lines.is_empty() && parsed.context_keys.is_empty() {
            continue;
        }

        let matches =
            resolve_meta_queries(engine, item_id, current_tags, &parsed, limit_per_doc).await?;
        if !matches.is_empty() {
            result.insert(short_name, matches);
        }
    }

    Ok(result)
}

/// Shared resolution for persistent and ad-hoc meta queries.
pub(crate) async fn resolve_meta_queries(
    engine: &MemoryEngine,
    item_id: &str,
    current_tags: &TagMap,
    parsed: &MetaQuery,
    limit: usize,
) -> EngineResult<Vec<Item>> {
    // Prerequisites: current item must carry every listed key.
    if !parsed
        .prereq_keys
        .iter()
        .all(|k| current_tags.get(k).is_some_and(|v| !v.is_empty()))
    {
        return Ok(Vec::new());
    }

    let mut context_values = TagMap::new();
    for key in &parsed.context_keys {
        if is_system_key(key) {
            continue;
        }
        if let Some(value) = current_tags.get(key) {
            if !value.is_empty() {
                context_values.insert(key.clone(), value.clone());
            }
        }
    }

    // Expansion: cross product of query lines × context values.
    let mut expanded: Vec<TagMap> = Vec::new();
    if !context_values.is_empty() && !parsed.query_lines.is_empty() {
        for query in &parsed.query_lines {
            for (ctx_key, ctx_val) in &context_values {
                let mut q = query.clone();
                q.insert(ctx_key.clone(), ctx_val.clone());
                expanded.push(q);
            }
        }
    } else if !context_values.is_empty() {
        for (ctx_key, ctx_val) in &context_values {
            let mut q = TagMap::new();
            q.insert(ctx_key.clone(), ctx_val.clone());
            expanded.push(q);
        }
    } else {
        expanded = parsed.query_lines.clone();
    }

    let pool = engine.pool();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut matches: Vec<Item> = Vec::new();
    for query in expanded {
        let folded: TagMap = query
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
            .collect();
        let records = documents::query_documents(
            pool,
            &ListFilter {
                tags: folded,
                include_system: false,
                limit: 100,
                ..Default::default()
            },
            ListOrder::Updated,
        )
        .await?;
        for rec in records {
            if rec.id == item_id || !seen.insert(rec.id.clone()) {
                continue;
            }
            matches.push(record_to_item(&rec, None, None));
        }
    }

    if matches.is_empty() {
        return Ok(Vec::new());
    }

    let ranked = rank_by_relevance(engine, item_id, matches).await?;
    Ok(ranked.into_iter().take(limit).collect())
}

/// Rank candidates by cosine-to-anchor, attenuated by recency decay.
/// Falls back to recency order when embeddings are unavailable.
async fn rank_by_relevance(
    engine: &MemoryEngine,
    anchor_id: &str,
    candidates: Vec<Item>,
) -> EngineResult<Vec<Item>> {
    let now = mnemo_core::time::utc_now();
    let half_life = engine.settings().decay_half_life_days;

    let anchor = engine.vectors().get_vector(anchor_id).await?;
    let mut scored: Vec<Item> = Vec::with_capacity(candidates.len());
    for mut item in candidates {
        let similarity = match (&anchor, engine.vectors().get_vector(&item.id).await?) {
            (Some(a), Some(b)) => cosine(a, &b),
            _ => 0.0,
        };
        let updated = item.updated().unwrap_or_default().to_string();
        item.score = Some(similarity * crate::decay::decay_factor(&updated, now, half_life));
        scored.push(item);
    }
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(scored)
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ── Constrained tags ────────────────────────────────────────────────

/// Check user tag values against `.tag/K` constraints. A write with
/// `tags[K]=v` is rejected unless `.tag/K/v` exists when `.tag/K`
/// carries `_constrained=true`.
pub(crate) async fn validate_constrained_tags(
    pool: &SqlitePool,
    tags: &TagMap,
) -> EngineResult<()> {
    for (key, value) in tags {
        if is_system_key(key) || value.is_empty() {
            continue;
        }
        let Some(parent) = documents::get(pool, &format!(".tag/{key}")).await? else {
            continue;
        };
        if parent.tags.get("_constrained").map(String::as_str) != Some("true") {
            continue;
        }
        if documents::get(pool, &format!(".tag/{key}/{value}")).await?.is_none() {
            let valid = list_constrained_values(pool, key).await?;
            return Err(EngineError::TagConstraint {
                key: key.clone(),
                value: value.clone(),
                valid,
            });
        }
    }
    Ok(())
}

pub(crate) async fn list_constrained_values(
    pool: &SqlitePool,
    key: &str,
) -> EngineResult<Vec<String>> {
    let prefix = format!(".tag/{key}/");
    let docs = documents::query_by_id_prefix(pool, &prefix).await?;
    Ok(docs
        .into_iter()
        .map(|d| d.id[prefix.len()..].to_string())
        .collect())
}

// ── Prompt selection ────────────────────────────────────────────────

/// Pick the prompt override for a family (`summarize` / `analyze`).
///
/// Match rules use the meta DSL before the `## Prompt` section. Among
/// matching prompt docs the one with the most satisfied rules wins;
/// ties break on lexical id order. Returns the default family prompt
/// when nothing else matches.
pub(crate) async fn select_prompt(
    pool: &SqlitePool,
    family: &str,
    doc_tags: &TagMap,
) -> EngineResult<Option<String>> {
    let prefix = format!(".prompt/{family}/");
    let mut docs = documents::query_by_id_prefix(pool, &prefix).await?;
    docs.sort_by(|a, b| a.id.cmp(&b.id));

    let mut best: Option<(usize, String)> = None;
    let mut default_prompt = None;

    for doc in docs {
        let (rules, prompt) = split_prompt_body(&doc.summary);
        let Some(prompt) = prompt else { continue };

        if doc.id == format!("{prefix}default") {
            default_prompt = Some(prompt.clone());
        }

        let parsed = parse_meta_doc(&rules);
        if parsed.query_lines.is_empty() {
            continue;
        }
        let satisfied = parsed
            .query_lines
            .iter()
            .filter(|line| {
                line.iter().all(|(k, v)| {
                    doc_tags
                        .get(&k.to_lowercase())
                        .is_some_and(|stored| stored.eq_ignore_ascii_case(v))
                })
            })
            .count();
        if satisfied > 0 {
            let better = match &best {
                None => true,
                Some((count, _)) => satisfied > *count,
            };
            if better {
                best = Some((satisfied, prompt));
            }
        }
    }

    Ok(best.map(|(_, p)| p).or(default_prompt))
}

/// Split a prompt doc body into (match rules, prompt section).
fn split_prompt_body(body: &str) -> (String, Option<String>) {
    let marker = "## Prompt";
    match body.find(marker) {
        Some(pos) => {
            let rules = body[..pos].to_string();
            let prompt = body[pos + marker.len()..].trim().to_string();
            (rules, (!prompt.is_empty()).then_some(prompt))
        }
        None => (body.to_string(), None),
    }
}

// ── Edge keys ───────────────────────────────────────────────────────

/// Tag keys declared as edges: `.tag/K` docs carrying `_inverse=V`.
/// Returns predicate → inverse verb.
pub(crate) async fn edge_keys(pool: &SqlitePool) -> EngineResult<BTreeMap<String, String>> {
    let docs = documents::query_by_id_prefix(pool, ".tag/").await?;
    let mut keys = BTreeMap::new();
    for doc in docs {
        let rest = &doc.id[".tag/".len()..];
        if rest.is_empty() || rest.contains('/') {
            continue;
        }
        if let Some(inverse) = doc.tags.get("_inverse") {
            if !inverse.is_empty() {
                keys.insert(rest.to_string(), inverse.clone());
            }
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_line_kinds() {
        let parsed = parse_meta_doc(
            "act=commitment status=open\nact=request status=open\nproject=\ntopic=*\nsome prose line\n",
        );
        assert_eq!(parsed.query_lines.len(), 2);
        assert_eq!(
            parsed.query_lines[0].get("act").map(String::as_str),
            Some("commitment")
        );
        assert_eq!(parsed.context_keys, vec!["project"]);
        assert_eq!(parsed.prereq_keys, vec!["topic"]);
    }

    #[test]
    fn prose_is_not_a_query() {
        let parsed = parse_meta_doc("This doc surfaces open todo items.\n\nact=commitment\n");
        assert_eq!(parsed.query_lines.len(), 1);
        assert!(parsed.context_keys.is_empty());
    }

    #[test]
    fn prompt_body_splits_at_marker() {
        let (rules, prompt) = split_prompt_body("type=conversation\n\n## Prompt\nSummarize the dialogue.");
        assert!(rules.contains("type=conversation"));
        assert_eq!(prompt.as_deref(), Some("Summarize the dialogue."));
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
