//! Structural decomposition of documents into parts.
//!
//! URI-sourced documents are re-fetched and analyzed as one chunk;
//! inline documents assemble their version trail so the decomposition
//! sees the temporal sequence. Re-analysis replaces the part set
//! atomically. `_analyzed_hash` records the content state the parts
//! describe, so unchanged documents skip the model call.

use mnemo_core::ids::{part_key, validate_id};
use mnemo_core::tags::{casefold_tags_for_index, filter_system_tags};
use mnemo_core::time::now_ts;
use tracing::{debug, info};

use mnemo_db::documents;
use mnemo_db::parts::{self, PartRecord};
use mnemo_db::{versions, TaskKind};

use crate::engine::{meta, MemoryEngine};
use crate::errors::{EngineError, EngineResult};
use crate::models::PartRef;

const MIN_ANALYZABLE_CHARS: usize = 50;

pub(crate) async fn analyze(
    engine: &MemoryEngine,
    id: &str,
    guide_tags: &[String],
    force: bool,
) -> EngineResult<Vec<PartRef>> {
    validate_id(id)?;
    let pool = engine.pool();

    let record = documents::get(pool, id)
        .await?
        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

    // Skip when the parts already describe this content.
    if !force {
        if let (Some(hash), Some(analyzed)) =
            (&record.content_hash, record.tags.get("_analyzed_hash"))
        {
            if hash == analyzed {
                debug!("parts already current for {id}, skipping analysis");
                return engine.list_parts(id).await;
            }
        }
    }

    // Build the text to analyze.
    let text = if record.tags.get("_source").map(String::as_str) == Some("uri") {
        match engine.providers().fetch(id).await {
            Ok(doc) if !doc.content.is_empty() => doc.content,
            _ => record.summary.clone(),
        }
    } else {
        let mut history = versions::list_versions(pool, id, 100).await?;
        history.reverse();
        if history.is_empty() {
            record.summary.clone()
        } else {
            let mut text = String::new();
            for v in &history {
                text.push_str(&format!("[{}]\n{}\n\n", &v.created_at[..10], v.summary));
            }
            text.push_str(&format!("[current]\n{}", record.summary));
            text
        }
    };

    if text.trim().chars().count() < MIN_ANALYZABLE_CHARS {
        return Err(EngineError::InvalidInput(format!(
            "document content too short to analyze: {id}"
        )));
    }

    // Guide context from tag descriptions.
    let mut guide_sections = Vec::new();
    for key in guide_tags {
        if let Some(tag_doc) = documents::get(pool, &format!(".tag/{key}")).await? {
            guide_sections.push(format!("## Tag: {key}\n{}", tag_doc.summary));
        }
    }
    let guide = guide_sections.join("\n\n");

    let system_prompt = meta::select_prompt(pool, "analyze", &record.tags)
        .await?
        .unwrap_or_else(|| "Decompose the text into meaningful sections.".to_string());

    let raw_parts = engine.providers().analyze(&text, &guide, &system_prompt).await?;

    // A single section is redundant with the note itself.
    if raw_parts.len() <= 1 {
        info!("content not decomposable into multiple parts: {id}");
        return Ok(Vec::new());
    }

    let parent_user_tags = filter_system_tags(&record.tags);
    let now = now_ts();
    let part_records: Vec<PartRecord> = raw_parts
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let mut tags = parent_user_tags.clone();
            tags.extend(raw.tags);
            PartRecord {
                doc_id: id.to_string(),
                part_num: i as u32 + 1,
                summary: raw.summary,
                tags,
                content: raw.content,
                created_at: now.clone(),
            }
        })
        .collect();

    // Replace parts in both stores.
    let old_count = parts::part_count(pool, id).await?;
    parts::replace_parts(pool, id, &part_records).await?;
    for n in 1..=old_count {
        engine.vectors().delete(&part_key(id, n)).await?;
    }
    // Part vectors follow the same provider-cost branch as the write
    // path: a cheap local backend embeds inline, a network backend
    // defers every part to the queue instead of blocking on N
    // sequential round-trips.
    for part in &part_records {
        let mut index_tags = casefold_tags_for_index(&part.tags);
        index_tags.insert("_part_num".into(), part.part_num.to_string());
        index_tags.insert("_base_id".into(), id.to_string());
        let key = part_key(id, part.part_num);

        let vector = if engine.providers().embedding_is_cheap() {
            match engine.providers().embed(pool, &part.summary).await {
                Ok(v) => Some(v),
                Err(e) if e.is_transient() => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        match vector {
            Some(v) => {
                engine
                    .vectors()
                    .upsert(&key, &v, &part.summary, &index_tags, &now, &now)
                    .await?;
            }
            None => {
                index_tags.insert("_embed_pending".into(), "1".into());
                engine
                    .vectors()
                    .upsert_meta(&key, &part.summary, &index_tags, &now, &now)
                    .await?;
                engine
                    .queue()
                    .enqueue(
                        &key,
                        TaskKind::Reembed,
                        &serde_json::json!({ "content": part.summary }),
                    )
                    .await?;
            }
        }
    }

    // Record the analyzed content state.
    if let Some(hash) = &record.content_hash {
        let mut tags = documents::get(pool, id)
            .await?
            .map(|r| r.tags)
            .unwrap_or_default();
        tags.insert("_analyzed_hash".into(), hash.clone());
        documents::update_tags_quiet(pool, id, &tags).await?;
    }

    // Constrained-tag classification runs as deferred work.
    if has_constrained_specs(engine).await? {
        engine
            .queue()
            .enqueue(id, TaskKind::TagClassify, &serde_json::json!({}))
            .await?;
    }

    engine.list_parts(id).await
}

pub(crate) async fn enqueue_analyze(
    engine: &MemoryEngine,
    id: &str,
    guide_tags: &[String],
) -> EngineResult<()> {
    validate_id(id)?;
    if !documents::exists(engine.pool(), id).await? {
        return Err(EngineError::NotFound(id.to_string()));
    }
    engine
        .queue()
        .enqueue(
            id,
            TaskKind::Analyze,
            &serde_json::json!({ "guide_tags": guide_tags }),
        )
        .await?;
    Ok(())
}

async fn has_constrained_specs(engine: &MemoryEngine) -> EngineResult<bool> {
    let docs = documents::query_by_id_prefix(engine.pool(), ".tag/").await?;
    Ok(docs.iter().any(|d| {
        d.tags.get("_constrained").map(String::as_str) == Some("true")
            && !d.id[".tag/".len()..].contains('/')
    }))
}
