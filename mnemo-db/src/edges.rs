//! Tag-derived edge rows and the backfill registry.
//!
//! An edge `(source_id, predicate, target_id)` exists iff the source has
//! tag `predicate=target_id` and `.tag/{predicate}` declares an inverse
//! verb. One row per (source, predicate): single-value tags mean a
//! source can point at only one target per key. Edge writes always ride
//! the same transaction as the tag write that caused them.

use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::DbResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRecord {
    pub source_id: String,
    pub predicate: String,
    pub target_id: String,
    pub inverse: String,
    pub created_at: String,
}

/// An inverse-block entry: who points here, via which verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InverseEdge {
    pub inverse: String,
    pub source_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct EdgeAdd {
    pub predicate: String,
    pub target_id: String,
    pub inverse: String,
}

/// Edge changes computed by the engine from an old/new tag comparison.
#[derive(Debug, Clone, Default)]
pub struct EdgeDelta {
    /// Predicates whose edge row must be removed.
    pub removed: Vec<String>,
    pub added: Vec<EdgeAdd>,
}

impl EdgeDelta {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

pub(crate) async fn apply_edge_delta(
    tx: &mut Transaction<'_, Sqlite>,
    source_id: &str,
    delta: &EdgeDelta,
    now: &str,
) -> DbResult<()> {
    for predicate in &delta.removed {
        sqlx::query("DELETE FROM edges WHERE source_id = ? AND predicate = ?")
            .bind(source_id)
            .bind(predicate)
            .execute(&mut **tx)
            .await?;
    }
    for add in &delta.added {
        sqlx::query(
            "INSERT OR REPLACE INTO edges (source_id, predicate, target_id, inverse, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(source_id)
        .bind(&add.predicate)
        .bind(&add.target_id)
        .bind(&add.inverse)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Apply a delta outside a document write (revert, backfill cleanup).
pub async fn apply_edge_delta_pool(
    pool: &SqlitePool,
    source_id: &str,
    delta: &EdgeDelta,
    now: &str,
) -> DbResult<()> {
    if delta.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    apply_edge_delta(&mut tx, source_id, delta, now).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn upsert_edge(
    pool: &SqlitePool,
    source_id: &str,
    predicate: &str,
    target_id: &str,
    inverse: &str,
    now: &str,
) -> DbResult<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO edges (source_id, predicate, target_id, inverse, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(source_id)
    .bind(predicate)
    .bind(target_id)
    .bind(inverse)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Documents pointing at `target_id`, grouped for the inverse block.
/// Ordered by (inverse, created DESC).
pub async fn get_inverse_edges(pool: &SqlitePool, target_id: &str) -> DbResult<Vec<InverseEdge>> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        r#"SELECT inverse, source_id, created_at FROM edges
           WHERE target_id = ?
           ORDER BY inverse ASC, created_at DESC"#,
    )
    .bind(target_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(inverse, source_id, created_at)| InverseEdge {
            inverse,
            source_id,
            created_at,
        })
        .collect())
}

/// Outbound edges of a document (deep-find traversal).
pub async fn list_edges_for_source(pool: &SqlitePool, source_id: &str) -> DbResult<Vec<EdgeRecord>> {
    let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
        r#"SELECT source_id, predicate, target_id, inverse, created_at FROM edges
           WHERE source_id = ? ORDER BY predicate"#,
    )
    .bind(source_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(source_id, predicate, target_id, inverse, created_at)| EdgeRecord {
            source_id,
            predicate,
            target_id,
            inverse,
            created_at,
        })
        .collect())
}

pub async fn delete_edges_for_source(pool: &SqlitePool, source_id: &str) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM edges WHERE source_id = ?")
        .bind(source_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_edges_for_target(pool: &SqlitePool, target_id: &str) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM edges WHERE target_id = ?")
        .bind(target_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Drop every edge for a predicate. Used when `.tag/K` loses its
/// `_inverse` declaration.
pub async fn delete_edges_for_predicate(pool: &SqlitePool, predicate: &str) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM edges WHERE predicate = ?")
        .bind(predicate)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// ── Backfill registry ───────────────────────────────────────────────

pub async fn upsert_backfill(
    pool: &SqlitePool,
    predicate: &str,
    inverse: &str,
    completed_at: Option<&str>,
) -> DbResult<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO edge_backfills (predicate, inverse, completed_at) VALUES (?, ?, ?)",
    )
    .bind(predicate)
    .bind(inverse)
    .bind(completed_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Completion timestamp for a backfill, or None when pending/unknown.
pub async fn get_backfill_status(pool: &SqlitePool, predicate: &str) -> DbResult<Option<String>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT completed_at FROM edge_backfills WHERE predicate = ? LIMIT 1")
            .bind(predicate)
            .fetch_optional(pool)
            .await?;
    Ok(row.and_then(|(c,)| c))
}

pub async fn delete_backfill(pool: &SqlitePool, predicate: &str) -> DbResult<()> {
    sqlx::query("DELETE FROM edge_backfills WHERE predicate = ?")
        .bind(predicate)
        .execute(pool)
        .await?;
    Ok(())
}
