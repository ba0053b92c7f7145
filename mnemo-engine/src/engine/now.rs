//! The current-intentions singleton and history relocation.

use mnemo_core::ids::{is_part_id, nowdoc_id, validate_id, version_key, NOWDOC_ID};
use mnemo_core::tags::{casefold_tags, TagMap};

use mnemo_db::versions;

use crate::engine::{system_docs, MemoryEngine};
use crate::errors::{EngineError, EngineResult};
use crate::models::{Item, PutRequest};

/// Get the nowdoc, creating it from the bundled default on first read.
pub(crate) async fn get_now(engine: &MemoryEngine, scope: Option<&str>) -> EngineResult<Item> {
    let doc_id = nowdoc_id(scope);
    if let Some(item) = engine.get(&doc_id).await? {
        return Ok(item);
    }
    match scope {
        Some(scope) => {
            set_now(
                engine,
                &format!("# Now ({scope})\n\nWorking context."),
                Some(scope),
                None,
            )
            .await
        }
        None => {
            let (content, tags) = system_docs::default_now();
            set_now(engine, &content, None, Some(tags)).await
        }
    }
}

/// Update the nowdoc; each update archives the previous state, so the
/// history is the intentions trail.
pub(crate) async fn set_now(
    engine: &MemoryEngine,
    content: &str,
    scope: Option<&str>,
    tags: Option<TagMap>,
) -> EngineResult<Item> {
    let doc_id = nowdoc_id(scope);
    let mut merged = tags.unwrap_or_default();
    if let Some(scope) = scope {
        merged
            .entry("user".to_string())
            .or_insert_with(|| scope.to_string());
    }
    let request = PutRequest {
        content: Some(content.to_string()),
        id: Some(doc_id),
        tags: (!merged.is_empty()).then_some(merged),
        ..Default::default()
    };
    engine.put(request).await
}

/// Move matching versions from `source` into `target`. The relocated
/// states keep their embeddings (vector keys are renamed, not
/// recomputed). An emptied plain `now` resets to the bundled default.
/// Returns the number of states moved.
pub(crate) async fn move_versions(
    engine: &MemoryEngine,
    target: &str,
    source: &str,
    tag_filter: Option<&TagMap>,
    only_current: bool,
) -> EngineResult<usize> {
    if target.is_empty() {
        return Err(EngineError::InvalidInput("target name cannot be empty".into()));
    }
    validate_id(target)?;
    validate_id(source)?;
    if is_part_id(target) || is_part_id(source) {
        return Err(EngineError::InvalidInput(
            "cannot move to or from a part id".into(),
        ));
    }
    if target == source {
        return Err(EngineError::InvalidInput(
            "source and target must differ".into(),
        ));
    }

    let folded_filter = tag_filter.map(casefold_tags);

    let _guard = engine.write_lock().lock().await;
    let pool = engine.pool();
    let now = mnemo_core::time::now_ts();

    if mnemo_db::documents::get(pool, source).await?.is_none() {
        return Err(EngineError::NotFound(source.to_string()));
    }

    let Some(result) = versions::extract_versions(
        pool,
        source,
        target,
        folded_filter.as_ref(),
        only_current,
        &now,
    )
    .await?
    else {
        return Err(EngineError::InvalidInput(format!(
            "no versions of {source:?} match the filter"
        )));
    };

    // Mirror the relocation in the vector store. Order matters: free
    // the target's current key first, then move history, then the new
    // current, then repair the source side.
    if let Some(ordinal) = result.target_archived_ordinal {
        engine
            .vectors()
            .rename(target, &version_key(target, ordinal))
            .await?;
    }
    for state in &result.moved {
        let source_key = match state.source_ordinal {
            Some(n) => version_key(source, n),
            None => source.to_string(),
        };
        let target_key = match state.target_ordinal {
            Some(m) => version_key(target, m),
            None => target.to_string(),
        };
        engine.vectors().rename(&source_key, &target_key).await?;
    }
    if let Some(promoted) = result.source_promoted_from {
        engine
            .vectors()
            .rename(&version_key(source, promoted), source)
            .await?;
    }
    for (old, new) in &result.source_renumbered {
        engine
            .vectors()
            .rename(&version_key(source, *old), &version_key(source, *new))
            .await?;
    }
    if result.source_emptied {
        engine.vectors().delete_for_doc(source).await?;
    }

    // Provenance tags on the relocated head.
    if let Some(saved) = mnemo_db::documents::get(pool, target).await? {
        let mut tags = saved.tags.clone();
        tags.insert("_saved_from".into(), source.to_string());
        tags.insert("_saved_at".into(), now.clone());
        mnemo_db::documents::update_tags_quiet(pool, target, &tags).await?;
        let index_tags = mnemo_core::tags::casefold_tags_for_index(&tags);
        let _ = engine
            .vectors()
            .update_meta(target, &saved.summary, &index_tags, &now)
            .await?;
    }

    let moved = result.moved.len();
    drop(_guard);

    // A fully-drained nowdoc starts fresh.
    if result.source_emptied && source == NOWDOC_ID {
        let (content, tags) = system_docs::default_now();
        set_now(engine, &content, None, Some(tags)).await?;
    }

    Ok(moved)
}
