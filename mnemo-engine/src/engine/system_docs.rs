//! Bundled system documents, seeded into new stores.
//!
//! System docs carry stable dot-prefixed ids and provide the default
//! tag vocabulary, meta queries, and prompts. Seeding preserves user
//! edits: a doc is only rewritten when the bundled content changed and
//! the stored copy still matches the previous bundled version (tracked
//! through the `bundled_hash` tag).

use mnemo_core::ids::content_hash;
use mnemo_core::tags::TagMap;
use mnemo_core::time::now_ts;
use mnemo_db::documents::{self, DocumentWrite};
use mnemo_db::edges::EdgeDelta;
use mnemo_db::TaskKind;
use tracing::info;

use crate::engine::MemoryEngine;
use crate::errors::EngineResult;

/// Bump when the bundled set changes; stores below this get re-seeded.
pub const SYSTEM_DOCS_VERSION: u32 = 1;

const BUNDLED: &[(&str, &str)] = &[
    ("now", include_str!("../../data/system/now.md")),
    (".tag/act", include_str!("../../data/system/tag-act.md")),
    (".tag/act/commitment", include_str!("../../data/system/tag-act-commitment.md")),
    (".tag/act/request", include_str!("../../data/system/tag-act-request.md")),
    (".tag/act/offer", include_str!("../../data/system/tag-act-offer.md")),
    (".tag/act/assertion", include_str!("../../data/system/tag-act-assertion.md")),
    (".tag/act/assessment", include_str!("../../data/system/tag-act-assessment.md")),
    (".tag/act/declaration", include_str!("../../data/system/tag-act-declaration.md")),
    (".tag/status", include_str!("../../data/system/tag-status.md")),
    (".tag/status/open", include_str!("../../data/system/tag-status-open.md")),
    (".tag/status/blocked", include_str!("../../data/system/tag-status-blocked.md")),
    (".tag/status/fulfilled", include_str!("../../data/system/tag-status-fulfilled.md")),
    (".tag/status/declined", include_str!("../../data/system/tag-status-declined.md")),
    (".tag/status/withdrawn", include_str!("../../data/system/tag-status-withdrawn.md")),
    (".tag/status/renegotiated", include_str!("../../data/system/tag-status-renegotiated.md")),
    (".tag/project", include_str!("../../data/system/tag-project.md")),
    (".tag/topic", include_str!("../../data/system/tag-topic.md")),
    (".meta/todo", include_str!("../../data/system/meta-todo.md")),
    (".meta/learnings", include_str!("../../data/system/meta-learnings.md")),
    (".prompt/summarize/default", include_str!("../../data/system/prompt-summarize-default.md")),
    (".prompt/analyze/default", include_str!("../../data/system/prompt-analyze-default.md")),
];

/// Split a bundled file into `key: value` frontmatter tags and body.
pub fn parse_frontmatter(raw: &str) -> (String, TagMap) {
    let mut tags = TagMap::new();
    let Some(rest) = raw.strip_prefix("---\n") else {
        return (raw.to_string(), tags);
    };
    let Some((header, body)) = rest.split_once("\n---\n") else {
        return (raw.to_string(), tags);
    };
    for line in header.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            if !key.is_empty() && !value.is_empty() {
                tags.insert(key.to_string(), value.to_string());
            }
        }
    }
    (body.trim_start_matches('\n').to_string(), tags)
}

/// The bundled default body and tags for the nowdoc.
pub fn default_now() -> (String, TagMap) {
    parse_frontmatter(include_str!("../../data/system/now.md"))
}

/// Seed bundled docs into the store, preserving user edits. Embeddings
/// are deferred to the queue so the first open never blocks on a
/// provider. The nowdoc itself is created lazily by `get_now`.
pub(crate) async fn ensure_seeded(engine: &MemoryEngine) -> EngineResult<u32> {
    let mut config = engine.config_file()?;
    if config.store.system_docs_version >= SYSTEM_DOCS_VERSION {
        return Ok(0);
    }

    let pool = engine.pool();
    let now = now_ts();
    let mut created = 0;

    for (id, raw) in BUNDLED {
        if *id == "now" {
            continue;
        }
        let (body, mut tags) = parse_frontmatter(raw);
        let bundled_hash = content_hash(&body);

        if let Some(existing) = documents::get(pool, id).await? {
            let prev_bundled = existing.tags.get("bundled_hash").map(String::as_str);
            if prev_bundled == Some(bundled_hash.as_str()) {
                continue;
            }
            if prev_bundled.is_some()
                && existing.content_hash.as_deref() != prev_bundled
            {
                info!("preserving user-edited system doc: {id}");
                continue;
            }
        }

        tags.insert("category".into(), "system".into());
        tags.insert("bundled_hash".into(), bundled_hash.clone());
        tags.insert("_source".into(), "inline".into());

        let write = DocumentWrite {
            id: id.to_string(),
            summary: body.clone(),
            tags,
            content_hash: Some(bundled_hash),
            content_hash_full: Some(mnemo_core::ids::content_hash_full(&body)),
            created_at_override: None,
        };
        if documents::exists(pool, id).await? {
            documents::delete_document(pool, id, false).await?;
        }
        documents::insert_document(pool, &write, &EdgeDelta::default(), &now).await?;
        engine
            .queue()
            .enqueue(id, TaskKind::Reembed, &serde_json::json!({ "content": body }))
            .await?;
        created += 1;
    }

    config.store.system_docs_version = SYSTEM_DOCS_VERSION;
    engine.save_config(&config)?;
    if created > 0 {
        info!("seeded {created} system docs, embeddings queued");
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_parses_tags_and_body() {
        let raw = "---\n_constrained: true\ncategory: system\n---\nBody text here.";
        let (body, tags) = parse_frontmatter(raw);
        assert_eq!(body, "Body text here.");
        assert_eq!(tags.get("_constrained").map(String::as_str), Some("true"));
        assert_eq!(tags.get("category").map(String::as_str), Some("system"));
    }

    #[test]
    fn plain_files_have_no_tags() {
        let (body, tags) = parse_frontmatter("Just text.");
        assert_eq!(body, "Just text.");
        assert!(tags.is_empty());
    }
}
