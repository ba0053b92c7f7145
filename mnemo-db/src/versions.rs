//! Version archival, offset lookup, revert, and history extraction.
//!
//! Ordinals of a document's versions are dense: `{1, 2, …, N}` with 1 the
//! oldest archived state. Offset addressing (0 = current, 1 = newest
//! archived) maps to `ordinal = N − offset + 1`. Every operation that
//! removes version rows renumbers the remainder to keep density.

use mnemo_core::tags::TagMap;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::documents::{replace_doc_tags, DocumentRecord};
use crate::error::DbResult;

#[derive(Debug, Clone)]
pub struct VersionRecord {
    pub doc_id: String,
    pub ordinal: u32,
    pub summary: String,
    pub tags: TagMap,
    pub content_hash: Option<String>,
    pub created_at: String,
}

type VersionRow = (String, i64, String, String, Option<String>, String);

fn row_to_version(row: VersionRow) -> DbResult<VersionRecord> {
    let (doc_id, ordinal, summary, tags_json, content_hash, created_at) = row;
    Ok(VersionRecord {
        doc_id,
        ordinal: ordinal as u32,
        summary,
        tags: serde_json::from_str(&tags_json)?,
        content_hash,
        created_at,
    })
}

const VERSION_COLUMNS: &str = "doc_id, ordinal, summary, tags_json, content_hash, created_at";

/// Versions newest-archived-first. Does not include the current state.
pub async fn list_versions(
    pool: &SqlitePool,
    doc_id: &str,
    limit: usize,
) -> DbResult<Vec<VersionRecord>> {
    let rows: Vec<VersionRow> = sqlx::query_as(&format!(
        "SELECT {VERSION_COLUMNS} FROM versions WHERE doc_id = ? ORDER BY ordinal DESC LIMIT ?"
    ))
    .bind(doc_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_version).collect()
}

pub async fn max_version(pool: &SqlitePool, doc_id: &str) -> DbResult<u32> {
    let row: Option<(Option<i64>,)> =
        sqlx::query_as("SELECT MAX(ordinal) FROM versions WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_optional(pool)
            .await?;
    Ok(row
        .and_then(|(m,)| m)
        .and_then(|m| u32::try_from(m).ok())
        .unwrap_or(0))
}

pub async fn version_count(pool: &SqlitePool, doc_id: &str) -> DbResult<u32> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM versions WHERE doc_id = ?")
        .bind(doc_id)
        .fetch_one(pool)
        .await?;
    Ok(n as u32)
}

/// Offset lookup, offset ≥ 1 (offset 0 is the current row, served by the
/// documents table). Single indexed query.
pub async fn get_by_offset(
    pool: &SqlitePool,
    doc_id: &str,
    offset: u32,
) -> DbResult<Option<VersionRecord>> {
    if offset == 0 {
        return Ok(None);
    }
    let row: Option<VersionRow> = sqlx::query_as(&format!(
        "SELECT {VERSION_COLUMNS} FROM versions WHERE doc_id = ? ORDER BY ordinal DESC LIMIT 1 OFFSET ?"
    ))
    .bind(doc_id)
    .bind((offset - 1) as i64)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_version).transpose()
}

/// Insert a version row directly. Import path only; the write protocol
/// archives through `documents::update_with_archive`.
pub async fn insert_version(
    pool: &SqlitePool,
    doc_id: &str,
    ordinal: u32,
    summary: &str,
    tags: &TagMap,
    content_hash: Option<&str>,
    created_at: &str,
) -> DbResult<()> {
    let tags_json = serde_json::to_string(tags)?;
    sqlx::query(
        "INSERT OR REPLACE INTO versions (doc_id, ordinal, summary, tags_json, content_hash, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(doc_id)
    .bind(ordinal as i64)
    .bind(summary)
    .bind(&tags_json)
    .bind(content_hash)
    .bind(created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Promote the newest archived version back to current and drop its row.
/// Returns the promoted version, or None when there is no history.
pub async fn restore_latest(
    pool: &SqlitePool,
    doc_id: &str,
    now: &str,
) -> DbResult<Option<VersionRecord>> {
    let mut tx = pool.begin().await?;

    let row: Option<VersionRow> = sqlx::query_as(&format!(
        "SELECT {VERSION_COLUMNS} FROM versions WHERE doc_id = ? ORDER BY ordinal DESC LIMIT 1"
    ))
    .bind(doc_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(None);
    };
    let version = row_to_version(row)?;

    let tags_json = serde_json::to_string(&version.tags)?;
    sqlx::query(
        r#"UPDATE documents
           SET summary = ?, tags_json = ?, content_hash = ?, content_hash_full = NULL,
               updated_at = ?, accessed_at = ?
           WHERE id = ?"#,
    )
    .bind(&version.summary)
    .bind(&tags_json)
    .bind(&version.content_hash)
    .bind(now)
    .bind(now)
    .bind(doc_id)
    .execute(&mut *tx)
    .await?;
    replace_doc_tags(&mut tx, doc_id, &version.tags).await?;

    sqlx::query("DELETE FROM versions WHERE doc_id = ? AND ordinal = ?")
        .bind(doc_id)
        .bind(version.ordinal as i64)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(Some(version))
}

// ── History extraction (move) ───────────────────────────────────────

/// One state relocated from the source to the target document.
#[derive(Debug, Clone)]
pub struct ExtractedState {
    /// Source ordinal; None when the state was the source's current.
    pub source_ordinal: Option<u32>,
    /// Target ordinal; None when the state became the target's current.
    pub target_ordinal: Option<u32>,
    pub summary: String,
    pub tags: TagMap,
    pub content_hash: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ExtractResult {
    /// Relocated states in chronological order; the last one is the
    /// target's new current.
    pub moved: Vec<ExtractedState>,
    /// Where the target's previous current was archived, if it existed.
    pub target_archived_ordinal: Option<u32>,
    /// The source document was fully emptied and removed.
    pub source_emptied: bool,
    /// Source version renumbering performed to restore density
    /// (old ordinal → new ordinal).
    pub source_renumbered: Vec<(u32, u32)>,
    /// Ordinal of the source version promoted to current after the
    /// current state was extracted, if any.
    pub source_promoted_from: Option<u32>,
}

fn tag_get_folded<'a>(tags: &'a TagMap, key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|(k, _)| k.to_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

fn tags_match(tags: &TagMap, filter: &TagMap) -> bool {
    filter.iter().all(|(k, v)| {
        tag_get_folded(tags, k).is_some_and(|stored| stored.to_lowercase() == v.to_lowercase())
    })
}

async fn load_current(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
) -> DbResult<Option<DocumentRecord>> {
    let row: Option<(String, String, String, Option<String>, Option<String>, String, String, String)> =
        sqlx::query_as(
            "SELECT id, summary, tags_json, content_hash, content_hash_full, created_at, updated_at, accessed_at FROM documents WHERE id = ? LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    let Some((id, summary, tags_json, content_hash, content_hash_full, created_at, updated_at, accessed_at)) = row
    else {
        return Ok(None);
    };
    Ok(Some(DocumentRecord {
        id,
        summary,
        tags: serde_json::from_str(&tags_json)?,
        content_hash,
        content_hash_full,
        created_at,
        updated_at,
        accessed_at,
    }))
}

/// Relocate versions matching `tag_filter` (and/or the current state)
/// from `source_id` into `target_id`, in one transaction. The tag filter
/// keys and values must be pre-casefolded. Returns None when nothing
/// matched; the stores are untouched in that case.
pub async fn extract_versions(
    pool: &SqlitePool,
    source_id: &str,
    target_id: &str,
    tag_filter: Option<&TagMap>,
    only_current: bool,
    now: &str,
) -> DbResult<Option<ExtractResult>> {
    let mut tx = pool.begin().await?;

    let Some(current) = load_current(&mut tx, source_id).await? else {
        tx.rollback().await?;
        return Ok(None);
    };

    let rows: Vec<VersionRow> = sqlx::query_as(&format!(
        "SELECT {VERSION_COLUMNS} FROM versions WHERE doc_id = ? ORDER BY ordinal ASC"
    ))
    .bind(source_id)
    .fetch_all(&mut *tx)
    .await?;
    let versions: Vec<VersionRecord> = rows
        .into_iter()
        .map(row_to_version)
        .collect::<DbResult<_>>()?;

    let matches = |tags: &TagMap| tag_filter.map(|f| tags_match(tags, f)).unwrap_or(true);

    let matched: Vec<&VersionRecord> = if only_current {
        Vec::new()
    } else {
        versions.iter().filter(|v| matches(&v.tags)).collect()
    };
    let current_matches = matches(&current.tags);

    if matched.is_empty() && !current_matches {
        tx.rollback().await?;
        return Ok(None);
    }

    // Chronological list of relocated states; last becomes target current.
    let mut moved: Vec<ExtractedState> = matched
        .iter()
        .map(|v| ExtractedState {
            source_ordinal: Some(v.ordinal),
            target_ordinal: None,
            summary: v.summary.clone(),
            tags: v.tags.clone(),
            content_hash: v.content_hash.clone(),
            created_at: v.created_at.clone(),
        })
        .collect();
    if current_matches {
        moved.push(ExtractedState {
            source_ordinal: None,
            target_ordinal: None,
            summary: current.summary.clone(),
            tags: current.tags.clone(),
            content_hash: current.content_hash.clone(),
            created_at: current.created_at.clone(),
        });
    }

    // Target side: archive its current state first, then append history.
    let existing_target = load_current(&mut tx, target_id).await?;
    let t_max: Option<(Option<i64>,)> =
        sqlx::query_as("SELECT MAX(ordinal) FROM versions WHERE doc_id = ?")
            .bind(target_id)
            .fetch_optional(&mut *tx)
            .await?;
    let mut next_ordinal = t_max
        .and_then(|(m,)| m)
        .and_then(|m| u32::try_from(m).ok())
        .unwrap_or(0)
        + 1;

    let mut target_archived_ordinal = None;
    if let Some(target) = &existing_target {
        let tags_json = serde_json::to_string(&target.tags)?;
        sqlx::query(
            "INSERT INTO versions (doc_id, ordinal, summary, tags_json, content_hash, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(target_id)
        .bind(next_ordinal as i64)
        .bind(&target.summary)
        .bind(&tags_json)
        .bind(&target.content_hash)
        .bind(&target.updated_at)
        .execute(&mut *tx)
        .await?;
        target_archived_ordinal = Some(next_ordinal);
        next_ordinal += 1;
    }

    let (history, newest) = moved.split_at_mut(matched.len() + usize::from(current_matches) - 1);
    for state in history.iter_mut() {
        let tags_json = serde_json::to_string(&state.tags)?;
        sqlx::query(
            "INSERT INTO versions (doc_id, ordinal, summary, tags_json, content_hash, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(target_id)
        .bind(next_ordinal as i64)
        .bind(&state.summary)
        .bind(&tags_json)
        .bind(&state.content_hash)
        .bind(&state.created_at)
        .execute(&mut *tx)
        .await?;
        state.target_ordinal = Some(next_ordinal);
        next_ordinal += 1;
    }

    // Newest relocated state becomes the target's current.
    let newest = &mut newest[0];
    let tags_json = serde_json::to_string(&newest.tags)?;
    sqlx::query(
        r#"INSERT INTO documents (id, summary, tags_json, content_hash, content_hash_full, created_at, updated_at, accessed_at)
           VALUES (?, ?, ?, ?, NULL, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
               summary = excluded.summary,
               tags_json = excluded.tags_json,
               content_hash = excluded.content_hash,
               content_hash_full = NULL,
               updated_at = excluded.updated_at,
               accessed_at = excluded.accessed_at"#,
    )
    .bind(target_id)
    .bind(&newest.summary)
    .bind(&tags_json)
    .bind(&newest.content_hash)
    .bind(&newest.created_at)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    replace_doc_tags(&mut tx, target_id, &newest.tags).await?;

    // Source side: remove extracted versions.
    for v in &matched {
        sqlx::query("DELETE FROM versions WHERE doc_id = ? AND ordinal = ?")
            .bind(source_id)
            .bind(v.ordinal as i64)
            .execute(&mut *tx)
            .await?;
    }

    let remaining: Vec<&VersionRecord> = versions
        .iter()
        .filter(|v| !matched.iter().any(|m| m.ordinal == v.ordinal))
        .collect();

    let mut source_emptied = false;
    let mut source_promoted_from = None;
    let mut promoted_ordinal: Option<u32> = None;

    if current_matches {
        if let Some(promote) = remaining.last() {
            let tags_json = serde_json::to_string(&promote.tags)?;
            sqlx::query(
                r#"UPDATE documents
                   SET summary = ?, tags_json = ?, content_hash = ?, content_hash_full = NULL,
                       updated_at = ?, accessed_at = ?
                   WHERE id = ?"#,
            )
            .bind(&promote.summary)
            .bind(&tags_json)
            .bind(&promote.content_hash)
            .bind(now)
            .bind(now)
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
            replace_doc_tags(&mut tx, source_id, &promote.tags).await?;
            sqlx::query("DELETE FROM versions WHERE doc_id = ? AND ordinal = ?")
                .bind(source_id)
                .bind(promote.ordinal as i64)
                .execute(&mut *tx)
                .await?;
            source_promoted_from = Some(promote.ordinal);
            promoted_ordinal = Some(promote.ordinal);
        } else {
            sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(source_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM doc_tags WHERE doc_id = ?")
                .bind(source_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM edges WHERE source_id = ?")
                .bind(source_id)
                .execute(&mut *tx)
                .await?;
            source_emptied = true;
        }
    }

    // Renumber the remaining source versions densely. New ordinals are
    // always ≤ old ordinals here, so ascending-order updates cannot
    // collide on the primary key.
    let mut source_renumbered = Vec::new();
    let survivors: Vec<u32> = remaining
        .iter()
        .map(|v| v.ordinal)
        .filter(|o| Some(*o) != promoted_ordinal)
        .collect();
    for (idx, old) in survivors.iter().enumerate() {
        let new = idx as u32 + 1;
        if new != *old {
            sqlx::query("UPDATE versions SET ordinal = ? WHERE doc_id = ? AND ordinal = ?")
                .bind(new as i64)
                .bind(source_id)
                .bind(*old as i64)
                .execute(&mut *tx)
                .await?;
            source_renumbered.push((*old, new));
        }
    }

    tx.commit().await?;

    Ok(Some(ExtractResult {
        moved,
        target_archived_ordinal,
        source_emptied,
        source_renumbered,
        source_promoted_from,
    }))
}
