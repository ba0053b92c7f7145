//! Background processing of deferred tasks.
//!
//! Workers claim tasks, run them, and ack on success. Transient errors
//! requeue with backoff; fatal errors (and exhausted retries) dead-
//! letter the task and surface a `_error` tag on the owning document.
//! A later success clears the tag.

use std::sync::Arc;

use mnemo_core::ids::EntityKey;
use mnemo_core::tags::casefold_tags_for_index;
use mnemo_core::time::now_ts;
use tracing::{debug, info, warn};

use mnemo_db::queue::NackOutcome;
use mnemo_db::{documents, parts, store, versions, PendingTask, TaskKind};

use crate::engine::{analyze, edges, meta, MemoryEngine};
use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessStats {
    pub processed: u32,
    pub retried: u32,
    pub dead_lettered: u32,
}

pub(crate) async fn process_pending(
    engine: &MemoryEngine,
    limit: usize,
) -> EngineResult<ProcessStats> {
    let worker_id = format!("worker-{}", std::process::id());
    let tasks = engine.queue().claim(&worker_id, limit).await?;
    let mut stats = ProcessStats::default();

    for task in tasks {
        match run_task(engine, &task).await {
            Ok(()) => {
                clear_error_tag(engine, &task).await?;
                engine.queue().ack(&task).await?;
                stats.processed += 1;
            }
            Err(e) if e.is_transient() => {
                let outcome = engine.queue().nack(&task, &e.to_string()).await?;
                match outcome {
                    NackOutcome::Requeued { .. } => stats.retried += 1,
                    NackOutcome::DeadLettered => {
                        mark_error_tag(engine, &task, &e).await?;
                        stats.dead_lettered += 1;
                    }
                }
            }
            Err(e) => {
                engine.queue().dead_letter(&task, &e.to_string()).await?;
                mark_error_tag(engine, &task, &e).await?;
                stats.dead_lettered += 1;
            }
        }
    }

    maybe_finish_reindex(engine).await?;
    Ok(stats)
}

/// Run until no runnable work remains (backoff-delayed tasks excluded).
pub(crate) async fn drain(engine: &MemoryEngine) -> EngineResult<ProcessStats> {
    let mut total = ProcessStats::default();
    loop {
        let stats = process_pending(engine, 50).await?;
        total.processed += stats.processed;
        total.retried += stats.retried;
        total.dead_lettered += stats.dead_lettered;
        if stats.processed == 0 && stats.retried == 0 && stats.dead_lettered == 0 {
            return Ok(total);
        }
    }
}

/// Spawn a pool of claim loops. They run until the returned handles are
/// aborted or the engine is dropped by all other holders.
pub fn spawn_workers(
    engine: Arc<MemoryEngine>,
    count: usize,
    poll_interval: std::time::Duration,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                debug!("background worker {i} started");
                loop {
                    match process_pending(&engine, 10).await {
                        Ok(stats) if stats.processed + stats.retried + stats.dead_lettered > 0 => {}
                        Ok(_) => tokio::time::sleep(poll_interval).await,
                        Err(e) => {
                            warn!("worker {i} pass failed: {e}");
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
            })
        })
        .collect()
}

async fn run_task(engine: &MemoryEngine, task: &PendingTask) -> EngineResult<()> {
    debug!("running {} task for {}", task.kind, task.doc_id);
    match task.kind {
        TaskKind::Summarize => run_summarize(engine, task).await,
        TaskKind::Embed => run_embed(engine, task).await,
        TaskKind::Reembed => run_reembed(engine, task).await,
        TaskKind::Analyze => run_analyze(engine, task).await,
        TaskKind::Ocr => run_ocr(engine, task).await,
        TaskKind::BackfillEdges => run_backfill(engine, task).await,
        TaskKind::TagClassify => run_tag_classify(engine, task).await,
    }
}

fn payload_content(task: &PendingTask) -> Option<String> {
    task.payload
        .get("content")
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// Compute a summary for content too long to store verbatim. The text
/// travels only in the queue payload; it was never persisted in the
/// document. No new version is created.
async fn run_summarize(engine: &MemoryEngine, task: &PendingTask) -> EngineResult<()> {
    let pool = engine.pool();
    let Some(record) = documents::get(pool, &task.doc_id).await? else {
        // Document deleted since enqueue; nothing to do.
        return Ok(());
    };
    let Some(content) = payload_content(task) else {
        return Ok(());
    };

    let prompt = meta::select_prompt(pool, "summarize", &record.tags)
        .await?
        .unwrap_or_else(|| "Summarize the following text in one or two sentences.".to_string());
    let mut summary = engine.providers().summarize(&content, &prompt).await?;
    let max_len = engine.settings().max_summary_length;
    if summary.chars().count() > max_len {
        summary = summary.chars().take(max_len).collect();
    }

    let now = now_ts();
    documents::update_summary(pool, &task.doc_id, &summary, &now).await?;

    // The vector still represents the content; refresh its metadata and
    // recompute so a deferred placeholder is also repaired here.
    let vector = engine.providers().embed(pool, &content).await?;
    let mut identity = engine.providers().embedding_identity();
    identity.dimension = vector.len();
    engine.ensure_identity(&identity).await?;

    let record = documents::get(pool, &task.doc_id).await?.unwrap_or(record);
    let index_tags = casefold_tags_for_index(&record.tags);
    engine
        .vectors()
        .upsert(&task.doc_id, &vector, &summary, &index_tags, &record.created_at, &now)
        .await?;
    Ok(())
}

/// Compute the deferred vector for a document and clear the pending
/// marker.
async fn run_embed(engine: &MemoryEngine, task: &PendingTask) -> EngineResult<()> {
    let pool = engine.pool();
    let Some(record) = documents::get(pool, &task.doc_id).await? else {
        return Ok(());
    };
    let content = payload_content(task).unwrap_or_else(|| record.summary.clone());

    let vector = engine.providers().embed(pool, &content).await?;
    let mut identity = engine.providers().embedding_identity();
    identity.dimension = vector.len();
    engine.ensure_identity(&identity).await?;

    let mut tags = record.tags.clone();
    tags.remove("_embed_pending");
    documents::update_tags_quiet(pool, &task.doc_id, &tags).await?;

    let now = now_ts();
    let index_tags = casefold_tags_for_index(&tags);
    engine
        .vectors()
        .upsert(&task.doc_id, &vector, &record.summary, &index_tags, &record.created_at, &now)
        .await?;
    Ok(())
}

/// Recompute a vector after a provider change or an import. The task id
/// may address a document, a version, or a part.
async fn run_reembed(engine: &MemoryEngine, task: &PendingTask) -> EngineResult<()> {
    let pool = engine.pool();
    let key = EntityKey::parse(&task.doc_id);

    let (text, summary, mut index_tags, created_at) = match &key {
        EntityKey::Doc(id) => {
            let Some(record) = documents::get(pool, id).await? else {
                return Ok(());
            };
            let text = payload_content(task).unwrap_or_else(|| record.summary.clone());
            (
                text,
                record.summary.clone(),
                casefold_tags_for_index(&record.tags),
                record.created_at.clone(),
            )
        }
        EntityKey::Version { doc_id, ordinal } => {
            // Reembed tasks address versions by ordinal, not offset.
            let Some(v) = version_by_ordinal(pool, doc_id, *ordinal).await? else {
                return Ok(());
            };
            let mut tags = casefold_tags_for_index(&v.tags);
            tags.insert("_version".into(), ordinal.to_string());
            tags.insert("_base_id".into(), doc_id.clone());
            let text = payload_content(task).unwrap_or_else(|| v.summary.clone());
            (text, v.summary.clone(), tags, v.created_at.clone())
        }
        EntityKey::Part { doc_id, part_num } => {
            let Some(p) = parts::get_part(pool, doc_id, *part_num).await? else {
                return Ok(());
            };
            let mut tags = casefold_tags_for_index(&p.tags);
            tags.insert("_part_num".into(), part_num.to_string());
            tags.insert("_base_id".into(), doc_id.clone());
            let text = payload_content(task).unwrap_or_else(|| p.summary.clone());
            (text, p.summary.clone(), tags, p.created_at.clone())
        }
    };

    let vector = engine.providers().embed(pool, &text).await?;
    let mut identity = engine.providers().embedding_identity();
    identity.dimension = vector.len();
    engine.ensure_identity(&identity).await?;

    index_tags.remove("_embed_pending");
    let now = now_ts();
    engine
        .vectors()
        .upsert(&key.storage_key(), &vector, &summary, &index_tags, &created_at, &now)
        .await?;
    Ok(())
}

async fn version_by_ordinal(
    pool: &sqlx::SqlitePool,
    doc_id: &str,
    ordinal: u32,
) -> EngineResult<Option<mnemo_db::VersionRecord>> {
    let max = versions::max_version(pool, doc_id).await?;
    if ordinal == 0 || ordinal > max {
        return Ok(None);
    }
    let offset = max - ordinal + 1;
    Ok(versions::get_by_offset(pool, doc_id, offset).await?)
}

async fn run_analyze(engine: &MemoryEngine, task: &PendingTask) -> EngineResult<()> {
    let guide_tags: Vec<String> = task
        .payload
        .get("guide_tags")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    match analyze::analyze(engine, &task.doc_id, &guide_tags, false).await {
        Ok(_) => Ok(()),
        // A vanished document is not a task failure.
        Err(EngineError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Extract text from non-text media and replace the placeholder
/// content-derived summary.
async fn run_ocr(engine: &MemoryEngine, task: &PendingTask) -> EngineResult<()> {
    let pool = engine.pool();
    let Some(record) = documents::get(pool, &task.doc_id).await? else {
        return Ok(());
    };
    let content_type = task
        .payload
        .get("content_type")
        .and_then(|v| v.as_str())
        .or_else(|| record.tags.get("_content_type").map(String::as_str))
        .unwrap_or("application/octet-stream")
        .to_string();

    let fetched = engine.providers().fetch(&task.doc_id).await?;
    let description = engine
        .providers()
        .describe(fetched.content.as_bytes(), &content_type)
        .await?;
    if description.is_empty() {
        return Ok(());
    }

    let max_len = engine.settings().max_summary_length;
    let summary: String = description.chars().take(max_len).collect();
    let now = now_ts();
    documents::update_summary(pool, &task.doc_id, &summary, &now).await?;

    let vector = engine.providers().embed(pool, &description).await?;
    let mut identity = engine.providers().embedding_identity();
    identity.dimension = vector.len();
    engine.ensure_identity(&identity).await?;
    let index_tags = casefold_tags_for_index(&record.tags);
    engine
        .vectors()
        .upsert(&task.doc_id, &vector, &summary, &index_tags, &record.created_at, &now)
        .await?;
    Ok(())
}

async fn run_backfill(engine: &MemoryEngine, task: &PendingTask) -> EngineResult<()> {
    let predicate = task
        .payload
        .get("predicate")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let inverse = task
        .payload
        .get("inverse")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if predicate.is_empty() || inverse.is_empty() {
        return Ok(());
    }
    let count = edges::backfill_edges(engine, &predicate, &inverse).await?;
    info!("backfilled {count} edges for {predicate}");
    Ok(())
}

/// Classify parts against the constrained tag vocabularies.
async fn run_tag_classify(engine: &MemoryEngine, task: &PendingTask) -> EngineResult<()> {
    let pool = engine.pool();
    let part_list = parts::list_parts(pool, &task.doc_id).await?;
    if part_list.is_empty() {
        return Ok(());
    }

    // Constrained specs: key → allowed values.
    let mut specs: Vec<(String, Vec<String>)> = Vec::new();
    for doc in documents::query_by_id_prefix(pool, ".tag/").await? {
        let rest = &doc.id[".tag/".len()..];
        if rest.contains('/') || rest.is_empty() {
            continue;
        }
        if doc.tags.get("_constrained").map(String::as_str) == Some("true") {
            let values = meta::list_constrained_values(pool, rest).await?;
            if !values.is_empty() {
                specs.push((rest.to_string(), values));
            }
        }
    }
    if specs.is_empty() {
        return Ok(());
    }

    let spec_lines: String = specs
        .iter()
        .map(|(key, values)| format!("{key}: one of {}", values.join(", ")))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        "Classify the text against these tag vocabularies. Respond only with \
         lines of the form key=value, one per applicable key, or nothing.\n{spec_lines}"
    );

    for part in &part_list {
        let response = engine.providers().summarize(&part.content, &prompt).await?;
        let mut tags = part.tags.clone();
        let mut changed = false;
        for line in response.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim().to_string();
            if let Some((_, allowed)) = specs.iter().find(|(k, _)| *k == key) {
                if allowed.iter().any(|a| a.eq_ignore_ascii_case(&value)) {
                    tags.insert(key, value);
                    changed = true;
                }
            }
        }
        if changed {
            parts::update_part_tags(pool, &task.doc_id, part.part_num, &tags).await?;
            engine
                .vectors()
                .update_meta(
                    &mnemo_core::ids::part_key(&task.doc_id, part.part_num),
                    &part.summary,
                    &casefold_tags_for_index(&tags),
                    &now_ts(),
                )
                .await?;
        }
    }
    Ok(())
}

// ── Error surfacing ─────────────────────────────────────────────────

async fn mark_error_tag(
    engine: &MemoryEngine,
    task: &PendingTask,
    error: &EngineError,
) -> EngineResult<()> {
    let doc_id = EntityKey::parse(&task.doc_id).doc_id().to_string();
    let Some(record) = documents::get(engine.pool(), &doc_id).await? else {
        return Ok(());
    };
    let message: String = error.to_string().chars().take(200).collect();
    let mut tags = record.tags.clone();
    tags.insert("_error".into(), format!("{}: {message}", error.kind()));
    documents::update_tags_quiet(engine.pool(), &doc_id, &tags).await?;
    Ok(())
}

async fn clear_error_tag(engine: &MemoryEngine, task: &PendingTask) -> EngineResult<()> {
    let doc_id = EntityKey::parse(&task.doc_id).doc_id().to_string();
    let Some(record) = documents::get(engine.pool(), &doc_id).await? else {
        return Ok(());
    };
    if !record.tags.contains_key("_error") {
        return Ok(());
    }
    let mut tags = record.tags.clone();
    tags.remove("_error");
    documents::update_tags_quiet(engine.pool(), &doc_id, &tags).await?;
    Ok(())
}

// ── Reindex support ─────────────────────────────────────────────────

/// Enqueue reembed work for every document, version, and part. Called
/// when the embedding identity changes.
pub(crate) async fn enqueue_reindex(engine: &MemoryEngine) -> EngineResult<u32> {
    let pool = engine.pool();
    let mut enqueued = 0u32;

    for doc_id in documents::list_ids(pool, true).await? {
        let Some(record) = documents::get(pool, &doc_id).await? else {
            continue;
        };
        engine
            .queue()
            .enqueue(
                &doc_id,
                TaskKind::Reembed,
                &serde_json::json!({ "content": record.summary }),
            )
            .await?;
        enqueued += 1;

        for v in versions::list_versions(pool, &doc_id, 10_000).await? {
            engine
                .queue()
                .enqueue(
                    &mnemo_core::ids::version_key(&doc_id, v.ordinal),
                    TaskKind::Reembed,
                    &serde_json::json!({ "content": v.summary }),
                )
                .await?;
            enqueued += 1;
        }
        for p in parts::list_parts(pool, &doc_id).await? {
            engine
                .queue()
                .enqueue(
                    &mnemo_core::ids::part_key(&doc_id, p.part_num),
                    TaskKind::Reembed,
                    &serde_json::json!({ "content": p.summary }),
                )
                .await?;
            enqueued += 1;
        }
    }
    Ok(enqueued)
}

/// Clear the reindexing flag once no reembed work remains.
async fn maybe_finish_reindex(engine: &MemoryEngine) -> EngineResult<()> {
    if !engine.is_reindexing().await? {
        return Ok(());
    }
    let stats = engine.queue().stats().await?;
    let reembed_left = stats
        .by_kind
        .iter()
        .any(|(kind, n)| kind == TaskKind::Reembed.as_str() && *n > 0);
    if !reembed_left {
        store::delete_meta(engine.pool(), store::META_REINDEXING).await?;
        info!("reindex complete");
    }
    Ok(())
}
