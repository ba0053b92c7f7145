//! Canonical document records and the tag/fulltext indices.
//!
//! The documents table is the source of truth for identity, summary,
//! tags, and timestamps. Original content is never stored. A `doc_tags`
//! side table holds a casefolded copy of every tag for indexed lookups,
//! replaced in the same transaction as the owning row.

use mnemo_core::tags::{casefold_tags_for_index, is_system_key, TagMap};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::edges::{apply_edge_delta, EdgeDelta};
use crate::error::DbResult;

#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: String,
    pub summary: String,
    pub tags: TagMap,
    pub content_hash: Option<String>,
    pub content_hash_full: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub accessed_at: String,
}

/// One write to the documents table, as computed by the engine.
#[derive(Debug, Clone)]
pub struct DocumentWrite {
    pub id: String,
    pub summary: String,
    pub tags: TagMap,
    pub content_hash: Option<String>,
    pub content_hash_full: Option<String>,
    /// Override for historical imports; preserved existing value otherwise.
    pub created_at_override: Option<String>,
}

const DOC_COLUMNS: &str = "id, summary, tags_json, content_hash, content_hash_full, created_at, updated_at, accessed_at";

fn row_to_record(row: &SqliteRow) -> DbResult<DocumentRecord> {
    let tags_json: String = row.try_get("tags_json")?;
    Ok(DocumentRecord {
        id: row.try_get("id")?,
        summary: row.try_get("summary")?,
        tags: serde_json::from_str(&tags_json)?,
        content_hash: row.try_get("content_hash")?,
        content_hash_full: row.try_get("content_hash_full")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        accessed_at: row.try_get("accessed_at")?,
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> DbResult<Option<DocumentRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {DOC_COLUMNS} FROM documents WHERE id = ? LIMIT 1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_record).transpose()
}

pub async fn get_many(pool: &SqlitePool, ids: &[String]) -> DbResult<Vec<DocumentRecord>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("SELECT {DOC_COLUMNS} FROM documents WHERE id IN ({placeholders})");
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;
    rows.iter().map(row_to_record).collect()
}

pub async fn exists(pool: &SqlitePool, id: &str) -> DbResult<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM documents WHERE id = ? LIMIT 1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub(crate) async fn replace_doc_tags(
    tx: &mut Transaction<'_, Sqlite>,
    doc_id: &str,
    tags: &TagMap,
) -> DbResult<()> {
    sqlx::query("DELETE FROM doc_tags WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;

    for (key, value) in casefold_tags_for_index(tags) {
        sqlx::query("INSERT OR REPLACE INTO doc_tags (doc_id, key, value) VALUES (?, ?, ?)")
            .bind(doc_id)
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Insert a brand-new document (phase D, create path).
pub async fn insert_document(
    pool: &SqlitePool,
    write: &DocumentWrite,
    edges: &EdgeDelta,
    now: &str,
) -> DbResult<DocumentRecord> {
    let created = write.created_at_override.clone().unwrap_or_else(|| now.to_string());
    let tags_json = serde_json::to_string(&write.tags)?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"INSERT INTO documents (id, summary, tags_json, content_hash, content_hash_full, created_at, updated_at, accessed_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&write.id)
    .bind(&write.summary)
    .bind(&tags_json)
    .bind(&write.content_hash)
    .bind(&write.content_hash_full)
    .bind(&created)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    replace_doc_tags(&mut tx, &write.id, &write.tags).await?;
    apply_edge_delta(&mut tx, &write.id, edges, now).await?;
    tx.commit().await?;

    Ok(DocumentRecord {
        id: write.id.clone(),
        summary: write.summary.clone(),
        tags: write.tags.clone(),
        content_hash: write.content_hash.clone(),
        content_hash_full: write.content_hash_full.clone(),
        created_at: created,
        updated_at: now.to_string(),
        accessed_at: now.to_string(),
    })
}

/// Archive-then-update in one transaction (phase D, versioned update).
/// Returns the ordinal the previous state was archived at.
pub async fn update_with_archive(
    pool: &SqlitePool,
    previous: &DocumentRecord,
    write: &DocumentWrite,
    edges: &EdgeDelta,
    now: &str,
) -> DbResult<u32> {
    let tags_json = serde_json::to_string(&write.tags)?;
    let prev_tags_json = serde_json::to_string(&previous.tags)?;

    let mut tx = pool.begin().await?;

    let max: Option<(Option<i64>,)> =
        sqlx::query_as("SELECT MAX(ordinal) FROM versions WHERE doc_id = ?")
            .bind(&write.id)
            .fetch_optional(&mut *tx)
            .await?;
    let ordinal = max
        .and_then(|(m,)| m)
        .and_then(|m| u32::try_from(m).ok())
        .unwrap_or(0)
        + 1;

    sqlx::query(
        r#"INSERT INTO versions (doc_id, ordinal, summary, tags_json, content_hash, created_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&write.id)
    .bind(ordinal as i64)
    .bind(&previous.summary)
    .bind(&prev_tags_json)
    .bind(&previous.content_hash)
    .bind(&previous.updated_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"UPDATE documents
           SET summary = ?, tags_json = ?, content_hash = ?, content_hash_full = ?,
               created_at = COALESCE(?, created_at), updated_at = ?, accessed_at = ?
           WHERE id = ?"#,
    )
    .bind(&write.summary)
    .bind(&tags_json)
    .bind(&write.content_hash)
    .bind(&write.content_hash_full)
    .bind(&write.created_at_override)
    .bind(now)
    .bind(now)
    .bind(&write.id)
    .execute(&mut *tx)
    .await?;

    replace_doc_tags(&mut tx, &write.id, &write.tags).await?;
    apply_edge_delta(&mut tx, &write.id, edges, now).await?;
    tx.commit().await?;

    Ok(ordinal)
}

/// Tag-only update: rewrite tags and updated_at without archival.
pub async fn update_tags_only(
    pool: &SqlitePool,
    id: &str,
    tags: &TagMap,
    edges: &EdgeDelta,
    now: &str,
) -> DbResult<bool> {
    let tags_json = serde_json::to_string(tags)?;

    let mut tx = pool.begin().await?;
    let result = sqlx::query("UPDATE documents SET tags_json = ?, updated_at = ? WHERE id = ?")
        .bind(&tags_json)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }
    replace_doc_tags(&mut tx, id, tags).await?;
    apply_edge_delta(&mut tx, id, edges, now).await?;
    tx.commit().await?;
    Ok(true)
}

/// Rewrite tags without touching updated_at. Used for system bookkeeping
/// tags (`_error`, `_analyzed_hash`) that must not look like a user edit.
pub async fn update_tags_quiet(pool: &SqlitePool, id: &str, tags: &TagMap) -> DbResult<bool> {
    let tags_json = serde_json::to_string(tags)?;
    let mut tx = pool.begin().await?;
    let result = sqlx::query("UPDATE documents SET tags_json = ? WHERE id = ?")
        .bind(&tags_json)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }
    replace_doc_tags(&mut tx, id, tags).await?;
    tx.commit().await?;
    Ok(true)
}

/// Replace the summary of an existing row (deferred summarization lands
/// here; no new version is created).
pub async fn update_summary(pool: &SqlitePool, id: &str, summary: &str, now: &str) -> DbResult<bool> {
    let result = sqlx::query("UPDATE documents SET summary = ?, updated_at = ? WHERE id = ?")
        .bind(summary)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn touch(pool: &SqlitePool, id: &str, now: &str) -> DbResult<()> {
    sqlx::query("UPDATE documents SET accessed_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn touch_many(pool: &SqlitePool, ids: &[String], now: &str) -> DbResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("UPDATE documents SET accessed_at = ? WHERE id IN ({placeholders})");
    let mut query = sqlx::query(&sql).bind(now);
    for id in ids {
        query = query.bind(id);
    }
    query.execute(pool).await?;
    Ok(())
}

/// Delete a document with its parts, edges (both directions), and
/// optionally its version history. Returns true if the row existed.
pub async fn delete_document(pool: &SqlitePool, id: &str, delete_versions: bool) -> DbResult<bool> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM doc_tags WHERE doc_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM parts WHERE doc_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM edges WHERE source_id = ? OR target_id = ?")
        .bind(id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    if delete_versions {
        sqlx::query("DELETE FROM versions WHERE doc_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

// ── Listing and index queries ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    Updated,
    Accessed,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub prefix: Option<String>,
    /// Casefolded key=value pairs, all must match.
    pub tags: TagMap,
    /// Casefolded keys that must be present with any value.
    pub tag_keys: Vec<String>,
    /// RFC 3339 cutoffs on updated_at.
    pub since: Option<String>,
    pub until: Option<String>,
    pub include_system: bool,
    pub limit: usize,
}

/// List documents with composable AND filters, most recent first.
pub async fn query_documents(
    pool: &SqlitePool,
    filter: &ListFilter,
    order: ListOrder,
) -> DbResult<Vec<DocumentRecord>> {
    let mut sql = format!("SELECT {DOC_COLUMNS} FROM documents d WHERE 1=1");
    let mut binds: Vec<String> = Vec::new();

    if let Some(prefix) = &filter.prefix {
        sql.push_str(" AND d.id LIKE ? ESCAPE '#'");
        binds.push(format!("{}%", escape_like(prefix)));
    }
    for (key, value) in &filter.tags {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM doc_tags t WHERE t.doc_id = d.id AND t.key = ? AND t.value = ?)",
        );
        binds.push(key.clone());
        binds.push(value.clone());
    }
    for key in &filter.tag_keys {
        sql.push_str(" AND EXISTS (SELECT 1 FROM doc_tags t WHERE t.doc_id = d.id AND t.key = ?)");
        binds.push(key.clone());
    }
    if let Some(since) = &filter.since {
        sql.push_str(" AND d.updated_at >= ?");
        binds.push(since.clone());
    }
    if let Some(until) = &filter.until {
        sql.push_str(" AND d.updated_at < ?");
        binds.push(until.clone());
    }
    if !filter.include_system {
        sql.push_str(" AND d.id NOT LIKE '.%'");
    }
    match order {
        ListOrder::Updated => sql.push_str(" ORDER BY d.updated_at DESC"),
        ListOrder::Accessed => sql.push_str(" ORDER BY d.accessed_at DESC"),
    }
    if filter.limit > 0 {
        sql.push_str(" LIMIT ?");
    }

    let mut query = sqlx::query(&sql);
    for b in &binds {
        query = query.bind(b);
    }
    if filter.limit > 0 {
        query = query.bind(filter.limit as i64);
    }
    let rows = query.fetch_all(pool).await?;
    rows.iter().map(row_to_record).collect()
}

pub async fn list_ids(pool: &SqlitePool, include_system: bool) -> DbResult<Vec<String>> {
    let sql = if include_system {
        "SELECT id FROM documents ORDER BY updated_at DESC"
    } else {
        "SELECT id FROM documents WHERE id NOT LIKE '.%' ORDER BY updated_at DESC"
    };
    let rows: Vec<(String,)> = sqlx::query_as(sql).fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn query_by_id_prefix(pool: &SqlitePool, prefix: &str) -> DbResult<Vec<DocumentRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {DOC_COLUMNS} FROM documents WHERE id LIKE ? ESCAPE '#' ORDER BY id"
    ))
    .bind(format!("{}%", escape_like(prefix)))
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_record).collect()
}

/// Dedup probe: another document (not `exclude_id`) with the same full
/// content hash, newest first.
pub async fn find_by_content_hash_full(
    pool: &SqlitePool,
    hash: &str,
    exclude_id: &str,
) -> DbResult<Vec<DocumentRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {DOC_COLUMNS} FROM documents WHERE content_hash_full = ? AND id != ? ORDER BY updated_at DESC"
    ))
    .bind(hash)
    .bind(exclude_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_record).collect()
}

/// Substring match over summaries, ranked by update recency.
pub async fn fulltext_search(
    pool: &SqlitePool,
    needle: &str,
    include_system: bool,
    limit: usize,
) -> DbResult<Vec<DocumentRecord>> {
    let mut sql = format!(
        "SELECT {DOC_COLUMNS} FROM documents WHERE summary LIKE ? ESCAPE '#'"
    );
    if !include_system {
        sql.push_str(" AND id NOT LIKE '.%'");
    }
    sql.push_str(" ORDER BY updated_at DESC LIMIT ?");

    let rows = sqlx::query(&sql)
        .bind(format!("%{}%", escape_like(needle)))
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_record).collect()
}

pub async fn list_distinct_tag_keys(pool: &SqlitePool) -> DbResult<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT key FROM doc_tags ORDER BY key")
            .fetch_all(pool)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(k,)| k)
        .filter(|k| !is_system_key(k))
        .collect())
}

pub async fn list_distinct_tag_values(pool: &SqlitePool, key: &str) -> DbResult<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT value FROM doc_tags WHERE key = ? ORDER BY value")
            .bind(key)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(v,)| v).collect())
}

pub async fn count(pool: &SqlitePool) -> DbResult<i64> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

pub async fn count_versions_total(pool: &SqlitePool) -> DbResult<i64> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM versions")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// Remove every document, version, part, tag row, and edge. Used by
/// import in replace mode.
pub async fn clear_all(pool: &SqlitePool) -> DbResult<()> {
    let mut tx = pool.begin().await?;
    for table in ["documents", "doc_tags", "versions", "parts", "edges", "edge_backfills"] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub(crate) fn escape_like(input: &str) -> String {
    input
        .replace('#', "##")
        .replace('%', "#%")
        .replace('_', "#_")
}
