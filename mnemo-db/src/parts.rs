//! Structural parts of a document.
//!
//! Unlike documents, parts retain their full text. A re-analysis
//! replaces the whole set atomically; parts are never individually
//! versioned.

use mnemo_core::tags::TagMap;
use sqlx::SqlitePool;

use crate::error::DbResult;

#[derive(Debug, Clone)]
pub struct PartRecord {
    pub doc_id: String,
    pub part_num: u32,
    pub summary: String,
    pub tags: TagMap,
    pub content: String,
    pub created_at: String,
}

type PartRow = (String, i64, String, String, String, String);

fn row_to_part(row: PartRow) -> DbResult<PartRecord> {
    let (doc_id, part_num, summary, tags_json, content, created_at) = row;
    Ok(PartRecord {
        doc_id,
        part_num: part_num as u32,
        summary,
        tags: serde_json::from_str(&tags_json)?,
        content,
        created_at,
    })
}

const PART_COLUMNS: &str = "doc_id, part_num, summary, tags_json, content, created_at";

/// Replace all parts of a document as a set.
pub async fn replace_parts(pool: &SqlitePool, doc_id: &str, parts: &[PartRecord]) -> DbResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM parts WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;
    for part in parts {
        let tags_json = serde_json::to_string(&part.tags)?;
        sqlx::query(
            "INSERT INTO parts (doc_id, part_num, summary, tags_json, content, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(doc_id)
        .bind(part.part_num as i64)
        .bind(&part.summary)
        .bind(&tags_json)
        .bind(&part.content)
        .bind(&part.created_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn get_part(
    pool: &SqlitePool,
    doc_id: &str,
    part_num: u32,
) -> DbResult<Option<PartRecord>> {
    let row: Option<PartRow> = sqlx::query_as(&format!(
        "SELECT {PART_COLUMNS} FROM parts WHERE doc_id = ? AND part_num = ? LIMIT 1"
    ))
    .bind(doc_id)
    .bind(part_num as i64)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_part).transpose()
}

pub async fn list_parts(pool: &SqlitePool, doc_id: &str) -> DbResult<Vec<PartRecord>> {
    let rows: Vec<PartRow> = sqlx::query_as(&format!(
        "SELECT {PART_COLUMNS} FROM parts WHERE doc_id = ? ORDER BY part_num ASC"
    ))
    .bind(doc_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_part).collect()
}

pub async fn part_count(pool: &SqlitePool, doc_id: &str) -> DbResult<u32> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM parts WHERE doc_id = ?")
        .bind(doc_id)
        .fetch_one(pool)
        .await?;
    Ok(n as u32)
}

pub async fn delete_parts(pool: &SqlitePool, doc_id: &str) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM parts WHERE doc_id = ?")
        .bind(doc_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn update_part_tags(
    pool: &SqlitePool,
    doc_id: &str,
    part_num: u32,
    tags: &TagMap,
) -> DbResult<bool> {
    let tags_json = serde_json::to_string(tags)?;
    let result = sqlx::query("UPDATE parts SET tags_json = ? WHERE doc_id = ? AND part_num = ?")
        .bind(&tags_json)
        .bind(doc_id)
        .bind(part_num as i64)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
