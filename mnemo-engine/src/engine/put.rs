//! The dual-store write protocol.
//!
//! One `put` proceeds in strict phases: normalize input, detect the
//! change class (no-op, tag-only, versioned), acquire an embedding
//! (dedup probe first, provider second, deferred placeholder last),
//! write the document side transactionally with archival, mirror the
//! vector side, then maintain derived edges. The phase order is what a
//! crash recovery leans on: a document row without its vector is
//! repaired by the queue, never the other way around.

use mnemo_core::ids::{
    content_hash, content_hash_full, is_part_id, is_system_id, normalize_id, text_content_id,
    validate_id, version_key,
};
use mnemo_core::tags::{
    casefold_tags, casefold_tags_for_index, filter_system_tags, is_system_key, user_tags_changed,
    validate_tag_key, validate_tag_value, TagMap,
};
use mnemo_core::time::now_ts;
use tracing::{debug, warn};

use mnemo_db::documents::{self, DocumentWrite};
use mnemo_db::edges::apply_edge_delta_pool;
use mnemo_db::{parts, versions, TaskKind};

use crate::engine::{edges, meta, MemoryEngine};
use crate::errors::{EngineError, EngineResult};
use crate::models::{record_to_item, part_to_item, Item, PutRequest};

pub(crate) async fn put(engine: &MemoryEngine, request: PutRequest) -> EngineResult<Item> {
    let PutRequest {
        content,
        uri,
        id,
        summary,
        tags,
        created_at,
    } = request;

    if content.is_some() && uri.is_some() {
        return Err(EngineError::InvalidInput(
            "provide content or uri, not both".into(),
        ));
    }
    if content.is_none() && uri.is_none() {
        return Err(EngineError::InvalidInput(
            "either content or uri is required".into(),
        ));
    }

    let user_tags = match tags {
        Some(raw) => {
            let folded = casefold_tags(&raw);
            for (key, value) in &folded {
                if !is_system_key(key) {
                    validate_tag_key(key)?;
                    validate_tag_value(key, value)?;
                }
            }
            let to_check: TagMap = folded
                .iter()
                .filter(|(k, v)| !is_system_key(k) && !v.is_empty())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            meta::validate_constrained_tags(engine.pool(), &to_check).await?;
            Some(folded)
        }
        None => None,
    };

    let effective_id = id.as_deref().or(uri.as_deref()).unwrap_or_default();
    if is_part_id(effective_id) {
        return Err(EngineError::InvalidInput(format!(
            "cannot modify part directly: {effective_id:?}; parts are managed by analyze"
        )));
    }

    // Required tags apply to user writes, not system docs.
    if !engine.settings().required_tags.is_empty() && !is_system_id(effective_id) {
        let present = user_tags.as_ref().cloned().unwrap_or_default();
        let missing: Vec<&str> = engine
            .settings()
            .required_tags
            .iter()
            .filter(|key| !present.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "required tags missing: {}",
                missing.join(", ")
            )));
        }
    }

    match uri {
        Some(uri) => put_uri(engine, &uri, user_tags, summary, created_at).await,
        None => {
            let content = content.unwrap_or_default();
            let id = match id {
                Some(id) => {
                    validate_id(&id)?;
                    id
                }
                None => text_content_id(&content),
            };
            let mut system_tags = TagMap::new();
            system_tags.insert("_source".into(), "inline".into());
            upsert(engine, &id, &content, user_tags, summary, system_tags, created_at).await
        }
    }
}

async fn put_uri(
    engine: &MemoryEngine,
    uri: &str,
    user_tags: Option<TagMap>,
    summary: Option<String>,
    mut created_at: Option<String>,
) -> EngineResult<Item> {
    let uri = normalize_id(uri)?;
    let is_file = uri.starts_with("file://") || uri.starts_with('/');

    // Fast path for local files: skip the read entirely when the stat
    // and the resulting tags would both be unchanged.
    if is_file && summary.is_none() {
        if let Some((mtime_ns, size)) = crate::providers::fetch::stat_file(&uri) {
            if let Some(existing) = documents::get(engine.pool(), &uri).await? {
                let stat_unchanged = existing.tags.get("_file_mtime_ns").map(String::as_str)
                    == Some(mtime_ns.to_string().as_str())
                    && existing.tags.get("_file_size").map(String::as_str)
                        == Some(size.to_string().as_str());
                if stat_unchanged {
                    let tags_unchanged = match &user_tags {
                        None => true,
                        Some(new) => {
                            let mut merged = filter_system_tags(&existing.tags);
                            merged.extend(new.clone());
                            !user_tags_changed(&existing.tags, &merged)
                        }
                    };
                    if tags_unchanged {
                        debug!("file stat unchanged, skipping read for {uri}");
                        return Ok(record_to_item(&existing, None, Some(false)));
                    }
                }
            }
        }
    }

    let doc = engine.providers().fetch(&uri).await?;

    let mut content = doc.content.clone();
    let mut enqueue_ocr = false;
    if let Some(ct) = &doc.content_type {
        if !ct.starts_with("text/") && !ct.starts_with("application/json") {
            // Non-text media: try an immediate description, otherwise a
            // placeholder goes in and the ocr task replaces it.
            match engine.providers().describe(content.as_bytes(), ct).await {
                Ok(description) if !description.is_empty() => {
                    if !content.is_empty() {
                        content.push_str("\n\nDescription:\n");
                    }
                    content.push_str(&description);
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => enqueue_ocr = true,
                Err(EngineError::ProviderUnavailable(_)) => enqueue_ocr = true,
                Err(e) => {
                    warn!("media description failed for {uri}: {e}");
                }
            }
        }
    }

    let mut system_tags = TagMap::new();
    system_tags.insert("_source".into(), "uri".into());
    if let Some(ct) = &doc.content_type {
        system_tags.insert("_content_type".into(), ct.clone());
    }
    if let Some((mtime_ns, size)) = doc.file_stat {
        system_tags.insert("_file_mtime_ns".into(), mtime_ns.to_string());
        system_tags.insert("_file_size".into(), size.to_string());
    }
    if created_at.is_none() {
        if let Some(birth) = doc.birthtime_secs {
            created_at = chrono::DateTime::from_timestamp(birth, 0)
                .map(mnemo_core::time::format_ts);
        }
    }

    let item = upsert(engine, &uri, &content, user_tags, summary, system_tags, created_at).await?;

    if enqueue_ocr {
        engine
            .queue()
            .enqueue(
                &uri,
                TaskKind::Ocr,
                &serde_json::json!({ "content_type": doc.content_type }),
            )
            .await?;
    }
    Ok(item)
}

/// Core upsert: phases B through G.
pub(crate) async fn upsert(
    engine: &MemoryEngine,
    id: &str,
    content: &str,
    user_tags: Option<TagMap>,
    summary: Option<String>,
    system_tags: TagMap,
    created_at: Option<String>,
) -> EngineResult<Item> {
    let _guard = engine.write_lock().lock().await;
    let pool = engine.pool();
    let now = now_ts();

    let existing = documents::get(pool, id).await?;
    let new_hash = content_hash(content);
    let new_hash_full = content_hash_full(content);

    // Tag merge, fixed priority order, later wins: existing user tags,
    // configured defaults, environment, caller, system.
    let mut merged = existing
        .as_ref()
        .map(|doc| filter_system_tags(&doc.tags))
        .unwrap_or_default();
    merged.extend(casefold_tags(&engine.settings().default_tags));
    merged.extend(engine.env_tags().clone());
    if let Some(user) = &user_tags {
        for (key, value) in filter_system_tags(user) {
            if value.is_empty() {
                merged.remove(&key);
            } else {
                merged.insert(key, value);
            }
        }
    }
    merged.extend(system_tags);

    // Phase B: change detection.
    let content_unchanged = existing
        .as_ref()
        .is_some_and(|doc| doc.content_hash.as_deref() == Some(new_hash.as_str()));
    let tags_changed = existing
        .as_ref()
        .is_some_and(|doc| user_tags_changed(&doc.tags, &merged));

    if content_unchanged && !tags_changed && summary.is_none() {
        debug!("content and tags unchanged, skipping {id}");
        return Ok(record_to_item(existing.as_ref().unwrap(), None, Some(false)));
    }

    // Summary policy.
    let max_len = engine.settings().max_summary_length;
    let mut enqueue_summarize = false;
    let final_summary = match &summary {
        Some(given) => {
            if given.chars().count() > max_len {
                warn!("summary exceeds max_summary_length, truncating for {id}");
                given.chars().take(max_len).collect()
            } else {
                given.clone()
            }
        }
        None if content_unchanged => {
            // Tag-only update keeps the summary; a changed tag context
            // may still warrant re-summarization of long content.
            if content.chars().count() > max_len {
                enqueue_summarize = true;
            }
            existing.as_ref().unwrap().summary.clone()
        }
        None if content.chars().count() <= max_len => content.to_string(),
        None => {
            enqueue_summarize = true;
            let truncated: String = content.chars().take(max_len).collect();
            format!("{truncated}...")
        }
    };

    // Phase C: embedding acquisition (create and versioned update only).
    // The dedup probe runs in both modes — a copied vector saves either
    // the model call or the network round-trip. Past that, the decision
    // axis is the provider's cost: a cheap local backend embeds inline,
    // a network backend defers to the queue unconditionally (the write
    // returns fast and the note is findable by tags/fulltext/id right
    // away; similarity search works once the worker lands the vector).
    let mut vector: Option<Vec<f32>> = None;
    let mut embed_pending = false;
    if !content_unchanged {
        vector = dedup_probe(engine, id, &new_hash_full).await?;
        if vector.is_none() {
            if engine.providers().embedding_is_cheap() {
                match engine.providers().embed(pool, content).await {
                    Ok(v) => vector = Some(v),
                    Err(e) if e.is_transient() => {
                        debug!("embedding deferred for {id}: {e}");
                        embed_pending = true;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                embed_pending = true;
            }
        }
    }
    if let Some(v) = &vector {
        let mut identity = engine.providers().embedding_identity();
        identity.dimension = v.len();
        engine.ensure_identity(&identity).await?;
    }
    if embed_pending {
        merged.insert("_embed_pending".into(), "1".into());
    }

    // Previous embedding, saved before the current entry is overwritten.
    let old_vector = if existing.is_some() && !content_unchanged {
        engine.vectors().get_vector(id).await?
    } else {
        None
    };

    let write = DocumentWrite {
        id: id.to_string(),
        summary: final_summary.clone(),
        tags: merged.clone(),
        content_hash: Some(new_hash),
        content_hash_full: Some(new_hash_full),
        created_at_override: created_at,
    };

    let old_user_tags = existing
        .as_ref()
        .map(|doc| filter_system_tags(&doc.tags))
        .unwrap_or_default();
    let edge_keys = edges::current_edge_keys(engine).await?;
    let delta = edges::compute_edge_delta(&old_user_tags, &filter_system_tags(&merged), &edge_keys);

    // Phase D: document store write (transactional, with archival).
    // Every re-supply archives the previous state, tag revisions
    // included; only the vector side distinguishes the two (a tag
    // revision leaves the vector alone).
    let archived_ordinal = match &existing {
        None => {
            documents::insert_document(pool, &write, &delta, &now).await?;
            None
        }
        Some(previous) => {
            Some(documents::update_with_archive(pool, previous, &write, &delta, &now).await?)
        }
    };

    // Phase E: vector store write, archived entry first.
    let index_tags = casefold_tags_for_index(&merged);
    if let (Some(ordinal), Some(previous)) = (archived_ordinal, existing.as_ref()) {
        if let Some(old_vec) = &old_vector {
            let mut version_tags = casefold_tags_for_index(&previous.tags);
            version_tags.insert("_version".into(), ordinal.to_string());
            version_tags.insert("_base_id".into(), id.to_string());
            engine
                .vectors()
                .upsert(
                    &version_key(id, ordinal),
                    old_vec,
                    &previous.summary,
                    &version_tags,
                    &previous.created_at,
                    &previous.updated_at,
                )
                .await?;
        }
    }
    let doc_created = existing
        .as_ref()
        .map(|d| d.created_at.clone())
        .unwrap_or_else(|| now.clone());
    match (&vector, content_unchanged) {
        (Some(v), _) => {
            engine
                .vectors()
                .upsert(id, v, &final_summary, &index_tags, &doc_created, &now)
                .await?;
        }
        (None, true) => {
            // Tag-only: refresh metadata, leave the vector alone.
            if !engine
                .vectors()
                .update_meta(id, &final_summary, &index_tags, &now)
                .await?
            {
                engine
                    .vectors()
                    .upsert_meta(id, &final_summary, &index_tags, &doc_created, &now)
                    .await?;
            }
        }
        (None, false) => {
            // Deferred embedding: a placeholder entry that the
            // pre-filter keeps out of search until the real vector lands.
            match engine.vectors().dimension().await? {
                Some(dim) => {
                    engine
                        .vectors()
                        .upsert(id, &vec![0.0; dim], &final_summary, &index_tags, &doc_created, &now)
                        .await?;
                }
                None => {
                    engine
                        .vectors()
                        .upsert_meta(id, &final_summary, &index_tags, &doc_created, &now)
                        .await?;
                }
            }
            engine
                .queue()
                .enqueue(id, TaskKind::Embed, &serde_json::json!({ "content": content }))
                .await?;
        }
    }

    // Phase F: derived maintenance.
    edges::vivify_targets(engine, &delta).await?;
    if id.starts_with(".tag/") {
        let old_full = existing.as_ref().map(|d| d.tags.clone()).unwrap_or_default();
        edges::process_tagdoc_inverse_change(engine, id, &old_full, &merged).await?;
    }
    if enqueue_summarize {
        engine
            .queue()
            .enqueue(id, TaskKind::Summarize, &serde_json::json!({ "content": content }))
            .await?;
    }

    // Phase G.
    let record = documents::get(pool, id)
        .await?
        .ok_or_else(|| EngineError::ConcurrentModification(id.to_string()))?;
    Ok(record_to_item(&record, None, Some(!content_unchanged)))
}

/// Phase C.1: copy the vector of another document with identical
/// content, when it matches the active dimension.
async fn dedup_probe(
    engine: &MemoryEngine,
    id: &str,
    hash_full: &str,
) -> EngineResult<Option<Vec<f32>>> {
    let Some(dim) = engine.vectors().dimension().await? else {
        return Ok(None);
    };
    let donors = documents::find_by_content_hash_full(engine.pool(), hash_full, id).await?;
    for donor in donors {
        if let Some(vector) = engine.vectors().get_vector(&donor.id).await? {
            if vector.len() == dim && vector.iter().any(|v| *v != 0.0) {
                debug!("dedup: copying vector from {} to {id}", donor.id);
                return Ok(Some(vector));
            }
        }
    }
    Ok(None)
}

// ── Tag-only operations ─────────────────────────────────────────────

pub(crate) async fn tag(engine: &MemoryEngine, id: &str, tags: &TagMap) -> EngineResult<Item> {
    validate_id(id)?;
    let folded = casefold_tags(tags);
    for (key, value) in &folded {
        if !is_system_key(key) {
            validate_tag_key(key)?;
            validate_tag_value(key, value)?;
        }
    }
    let to_check: TagMap = folded
        .iter()
        .filter(|(k, v)| !is_system_key(k) && !v.is_empty())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    meta::validate_constrained_tags(engine.pool(), &to_check).await?;

    let _guard = engine.write_lock().lock().await;
    let pool = engine.pool();
    let now = now_ts();

    let existing = documents::get(pool, id)
        .await?
        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

    let mut merged = existing.tags.clone();
    for (key, value) in &folded {
        if is_system_key(key) {
            continue;
        }
        if value.is_empty() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }

    if !user_tags_changed(&existing.tags, &merged) {
        return Ok(record_to_item(&existing, None, Some(false)));
    }

    let edge_keys = edges::current_edge_keys(engine).await?;
    let delta = edges::compute_edge_delta(
        &filter_system_tags(&existing.tags),
        &filter_system_tags(&merged),
        &edge_keys,
    );

    documents::update_tags_only(pool, id, &merged, &delta, &now).await?;
    let index_tags = casefold_tags_for_index(&merged);
    engine
        .vectors()
        .update_meta(id, &existing.summary, &index_tags, &now)
        .await?;
    edges::vivify_targets(engine, &delta).await?;

    let record = documents::get(pool, id)
        .await?
        .ok_or_else(|| EngineError::ConcurrentModification(id.to_string()))?;
    Ok(record_to_item(&record, None, Some(false)))
}

pub(crate) async fn tag_part(
    engine: &MemoryEngine,
    id: &str,
    part_num: u32,
    tags: &TagMap,
) -> EngineResult<Item> {
    validate_id(id)?;
    let folded = casefold_tags(tags);
    for (key, value) in &folded {
        if !is_system_key(key) {
            validate_tag_key(key)?;
            validate_tag_value(key, value)?;
        }
    }

    let _guard = engine.write_lock().lock().await;
    let pool = engine.pool();
    let now = now_ts();

    let part = parts::get_part(pool, id, part_num)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("{id}@p{part_num}")))?;

    let mut merged = part.tags.clone();
    for (key, value) in &folded {
        if is_system_key(key) {
            continue;
        }
        if value.is_empty() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }

    parts::update_part_tags(pool, id, part_num, &merged).await?;
    engine
        .vectors()
        .update_meta(
            &mnemo_core::ids::part_key(id, part_num),
            &part.summary,
            &casefold_tags_for_index(&merged),
            &now,
        )
        .await?;

    let updated = parts::get_part(pool, id, part_num)
        .await?
        .ok_or_else(|| EngineError::ConcurrentModification(id.to_string()))?;
    let total = parts::part_count(pool, id).await?;
    Ok(part_to_item(id, &updated, total))
}

// ── Delete and revert ───────────────────────────────────────────────

pub(crate) async fn delete(
    engine: &MemoryEngine,
    id: &str,
    delete_versions: bool,
) -> EngineResult<bool> {
    validate_id(id)?;
    if is_part_id(id) {
        return Err(EngineError::InvalidInput(format!(
            "cannot delete part directly: {id:?}; re-analyze or delete the parent"
        )));
    }
    let _guard = engine.write_lock().lock().await;
    let doc_deleted = documents::delete_document(engine.pool(), id, delete_versions).await?;
    let vec_deleted = engine.vectors().delete_for_doc(id).await?;
    Ok(doc_deleted || vec_deleted)
}

pub(crate) async fn revert(engine: &MemoryEngine, id: &str) -> EngineResult<Option<Item>> {
    validate_id(id)?;
    if is_part_id(id) {
        return Err(EngineError::InvalidInput(format!(
            "cannot revert part directly: {id:?}"
        )));
    }
    let _guard = engine.write_lock().lock().await;
    let pool = engine.pool();
    let now = now_ts();

    let max_ver = versions::max_version(pool, id).await?;
    if max_ver == 0 {
        documents::delete_document(pool, id, true).await?;
        engine.vectors().delete_for_doc(id).await?;
        return Ok(None);
    }

    let previous = documents::get(pool, id).await?;
    let part_list = parts::list_parts(pool, id).await?;
    let archived_key = version_key(id, max_ver);
    let archived_vector = engine.vectors().get_vector(&archived_key).await?;

    let Some(restored) = versions::restore_latest(pool, id, &now).await? else {
        documents::delete_document(pool, id, true).await?;
        engine.vectors().delete_for_doc(id).await?;
        return Ok(None);
    };

    // Edges follow the restored tag state.
    if let Some(previous) = &previous {
        let edge_keys = edges::current_edge_keys(engine).await?;
        let delta = edges::compute_edge_delta(
            &filter_system_tags(&previous.tags),
            &filter_system_tags(&restored.tags),
            &edge_keys,
        );
        apply_edge_delta_pool(pool, id, &delta, &now).await?;
        edges::vivify_targets(engine, &delta).await?;
    }

    let index_tags = casefold_tags_for_index(&restored.tags);
    if let Some(vector) = archived_vector {
        engine
            .vectors()
            .upsert(id, &vector, &restored.summary, &index_tags, &restored.created_at, &now)
            .await?;
    }
    engine.vectors().delete(&archived_key).await?;

    // Parts described the reverted content; drop them.
    parts::delete_parts(pool, id).await?;
    for part in &part_list {
        engine
            .vectors()
            .delete(&mnemo_core::ids::part_key(id, part.part_num))
            .await?;
    }

    let record = documents::get(pool, id).await?;
    Ok(record.map(|r| record_to_item(&r, None, None)))
}
