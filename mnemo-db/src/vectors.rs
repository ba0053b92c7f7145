//! Embedding index keyed by entity-key strings.
//!
//! Every entry has a metadata row in `embeddings` (summary + casefolded
//! tags, so search results render without a document join) and a vector
//! in the `doc_vec` vec0 table sharing the same rowid. The vec table is
//! created lazily when the first vector pins the collection dimension.
//!
//! The tag/time pre-filter runs before nearest-neighbor scoring: the
//! candidate rowid set is computed from the metadata rows first and the
//! KNN scan is constrained to it. This is a correctness feature — tags
//! are used for tenant isolation — not a performance one.

use mnemo_core::tags::TagMap;
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use crate::store;

#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub key: String,
    pub summary: String,
    pub tags: TagMap,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub key: String,
    /// Raw cosine similarity in [-1, 1].
    pub similarity: f32,
    pub summary: String,
    pub tags: TagMap,
    pub updated_at: String,
}

/// Pre-filter applied before the nearest-neighbor scan. Tag values of
/// `"*"` mean key presence; the time window filters on `updated_at`.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub tags: TagMap,
    pub since: Option<String>,
    pub until: Option<String>,
    /// Include entries still waiting for a real vector.
    pub include_pending: bool,
}

#[derive(Debug, Clone)]
pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn dimension(&self) -> DbResult<Option<usize>> {
        store::vector_dimension(&self.pool).await
    }

    /// Insert or replace an entry. The first vector written pins the
    /// collection dimension; a differing dimension afterwards is fatal.
    pub async fn upsert(
        &self,
        key: &str,
        vector: &[f32],
        summary: &str,
        tags: &TagMap,
        created_at: &str,
        updated_at: &str,
    ) -> DbResult<()> {
        match self.dimension().await? {
            Some(dim) if dim != vector.len() => {
                return Err(DbError::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                });
            }
            Some(_) => {}
            None => store::ensure_vec_table(&self.pool, vector.len()).await?,
        }

        let tags_json = serde_json::to_string(tags)?;
        sqlx::query(
            r#"INSERT INTO embeddings (key, summary, tags_json, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET
                   summary = excluded.summary,
                   tags_json = excluded.tags_json,
                   updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(summary)
        .bind(&tags_json)
        .bind(created_at)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        let (rowid,): (i64,) = sqlx::query_as("SELECT rowid FROM embeddings WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;

        let payload = serde_json::to_string(vector)?;
        sqlx::query("INSERT OR REPLACE INTO doc_vec (rowid, embedding) VALUES (?, ?)")
            .bind(rowid)
            .bind(&payload)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Write a metadata row with no vector yet. Used for entries whose
    /// embedding is still pending in the queue.
    pub async fn upsert_meta(
        &self,
        key: &str,
        summary: &str,
        tags: &TagMap,
        created_at: &str,
        updated_at: &str,
    ) -> DbResult<()> {
        let tags_json = serde_json::to_string(tags)?;
        sqlx::query(
            r#"INSERT INTO embeddings (key, summary, tags_json, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET
                   summary = excluded.summary,
                   tags_json = excluded.tags_json,
                   updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(summary)
        .bind(&tags_json)
        .bind(created_at)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh summary/tags without touching the vector (tag-only writes).
    pub async fn update_meta(
        &self,
        key: &str,
        summary: &str,
        tags: &TagMap,
        updated_at: &str,
    ) -> DbResult<bool> {
        let tags_json = serde_json::to_string(tags)?;
        let result = sqlx::query(
            "UPDATE embeddings SET summary = ?, tags_json = ?, updated_at = ? WHERE key = ?",
        )
        .bind(summary)
        .bind(&tags_json)
        .bind(updated_at)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, key: &str) -> DbResult<Option<EmbeddingRecord>> {
        let row: Option<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT key, summary, tags_json, created_at, updated_at FROM embeddings WHERE key = ? LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        let Some((key, summary, tags_json, created_at, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(EmbeddingRecord {
            key,
            summary,
            tags: serde_json::from_str(&tags_json)?,
            created_at,
            updated_at,
        }))
    }

    pub async fn exists(&self, key: &str) -> DbResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM embeddings WHERE key = ? LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// The stored vector for a key, if present.
    pub async fn get_vector(&self, key: &str) -> DbResult<Option<Vec<f32>>> {
        if self.dimension().await?.is_none() {
            return Ok(None);
        }
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            r#"SELECT v.embedding FROM doc_vec v
               JOIN embeddings e ON e.rowid = v.rowid
               WHERE e.key = ? LIMIT 1"#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(bytes,)| decode_vector(&bytes)))
    }

    /// KNN query with the pre-filter applied first.
    pub async fn query(
        &self,
        vector: &[f32],
        filter: &VectorFilter,
        limit: usize,
    ) -> DbResult<Vec<VectorHit>> {
        let Some(dim) = self.dimension().await? else {
            return Ok(Vec::new());
        };
        if dim != vector.len() {
            return Err(DbError::DimensionMismatch {
                expected: dim,
                actual: vector.len(),
            });
        }

        let candidates = self.filter_rowids(filter).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = candidates.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            r#"SELECT e.key, v.distance, e.summary, e.tags_json, e.updated_at
               FROM doc_vec v
               JOIN embeddings e ON e.rowid = v.rowid
               WHERE v.embedding MATCH ? AND v.rowid IN ({placeholders})
               ORDER BY v.distance ASC
               LIMIT ?"#
        );
        let payload = serde_json::to_string(vector)?;
        let mut query = sqlx::query_as::<_, (String, f32, String, String, String)>(&sql);
        query = query.bind(&payload);
        for rowid in &candidates {
            query = query.bind(rowid);
        }
        query = query.bind(limit as i64);
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|(key, distance, summary, tags_json, updated_at)| {
                Ok(VectorHit {
                    key,
                    similarity: 1.0 - distance,
                    summary,
                    tags: serde_json::from_str(&tags_json)?,
                    updated_at,
                })
            })
            .collect()
    }

    /// Like [`query`], using the stored vector of an existing key.
    pub async fn query_by_key(
        &self,
        key: &str,
        filter: &VectorFilter,
        limit: usize,
    ) -> DbResult<Vec<VectorHit>> {
        match self.get_vector(key).await? {
            Some(vector) => self.query(&vector, filter, limit).await,
            None => Ok(Vec::new()),
        }
    }

    async fn filter_rowids(&self, filter: &VectorFilter) -> DbResult<Vec<i64>> {
        let mut sql = String::from("SELECT rowid FROM embeddings WHERE 1=1");
        let mut binds: Vec<String> = Vec::new();

        for (key, value) in &filter.tags {
            let path = json_path(key);
            if value == "*" {
                sql.push_str(" AND json_extract(tags_json, ?) IS NOT NULL");
                binds.push(path);
            } else {
                sql.push_str(" AND json_extract(tags_json, ?) = ?");
                binds.push(path);
                binds.push(value.clone());
            }
        }
        if let Some(since) = &filter.since {
            sql.push_str(" AND updated_at >= ?");
            binds.push(since.clone());
        }
        if let Some(until) = &filter.until {
            sql.push_str(" AND updated_at < ?");
            binds.push(until.clone());
        }
        if !filter.include_pending {
            sql.push_str(" AND json_extract(tags_json, '$._embed_pending') IS NULL");
        }

        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn delete(&self, key: &str) -> DbResult<bool> {
        self.delete_keys_like(key, false).await
    }

    /// Delete a document's entry together with its version and part
    /// entries (`id`, `id@v*`, `id@p*`).
    pub async fn delete_for_doc(&self, doc_id: &str) -> DbResult<bool> {
        self.delete_keys_like(doc_id, true).await
    }

    async fn delete_keys_like(&self, key: &str, with_suffixes: bool) -> DbResult<bool> {
        let mut sql = String::from("SELECT rowid FROM embeddings WHERE key = ?");
        if with_suffixes {
            sql.push_str(" OR key LIKE ? ESCAPE '#'");
        }
        let mut query = sqlx::query_as::<_, (i64,)>(&sql).bind(key);
        if with_suffixes {
            query = query.bind(format!("{}@%", crate::documents::escape_like(key)));
        }
        let rowids: Vec<(i64,)> = query.fetch_all(&self.pool).await?;
        if rowids.is_empty() {
            return Ok(false);
        }

        let has_vec_table = self.dimension().await?.is_some();
        for (rowid,) in &rowids {
            if has_vec_table {
                sqlx::query("DELETE FROM doc_vec WHERE rowid = ?")
                    .bind(rowid)
                    .execute(&self.pool)
                    .await?;
            }
            sqlx::query("DELETE FROM embeddings WHERE rowid = ?")
                .bind(rowid)
                .execute(&self.pool)
                .await?;
        }
        Ok(true)
    }

    /// Remove every entry. Used by import in replace mode; the vectors
    /// regenerate from reembed tasks.
    pub async fn clear(&self) -> DbResult<()> {
        if self.dimension().await?.is_some() {
            sqlx::query("DELETE FROM doc_vec").execute(&self.pool).await?;
        }
        sqlx::query("DELETE FROM embeddings").execute(&self.pool).await?;
        Ok(())
    }

    /// Re-key an entry, keeping its vector. Used when versions are
    /// relocated between documents.
    pub async fn rename(&self, old_key: &str, new_key: &str) -> DbResult<bool> {
        self.delete(new_key).await?;
        let result = sqlx::query("UPDATE embeddings SET key = ? WHERE key = ?")
            .bind(new_key)
            .bind(old_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', ""))
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
