//! Two-level embedding cache.
//!
//! In-memory LRU keyed `(model identity, text hash)` for the hot path,
//! backed by the persistent `embedding_cache` table so repeated texts
//! survive restarts. Eviction is size-based; the lock is held only for
//! map access, never across an await.

use std::collections::HashMap;
use std::sync::Mutex;

use mnemo_core::config::EmbeddingIdentity;
use mnemo_core::ids::content_hash_full;
use mnemo_core::time::now_ts;
use sqlx::SqlitePool;

use crate::errors::EngineResult;

struct LruInner {
    map: HashMap<String, Vec<f32>>,
    order: Vec<String>,
}

pub struct EmbeddingCache {
    capacity: usize,
    inner: Mutex<LruInner>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    fn cache_key(identity: &EmbeddingIdentity, text: &str) -> (String, String) {
        let text_hash = content_hash_full(text);
        let full = format!("{}:{}", identity.key(), text_hash);
        (full, text_hash)
    }

    pub async fn get(
        &self,
        pool: &SqlitePool,
        identity: &EmbeddingIdentity,
        text: &str,
    ) -> EngineResult<Option<Vec<f32>>> {
        let (full_key, text_hash) = Self::cache_key(identity, text);

        if let Some(hit) = self.memory_get(&full_key) {
            return Ok(Some(hit));
        }

        let row: Option<(String,)> = sqlx::query_as(
            "SELECT vector_json FROM embedding_cache WHERE model_key = ? AND text_hash = ? LIMIT 1",
        )
        .bind(identity.key())
        .bind(&text_hash)
        .fetch_optional(pool)
        .await
        .map_err(mnemo_db::DbError::from)?;

        let Some((vector_json,)) = row else {
            return Ok(None);
        };
        let vector: Vec<f32> = serde_json::from_str(&vector_json)?;
        self.memory_put(full_key, vector.clone());
        Ok(Some(vector))
    }

    pub async fn put(
        &self,
        pool: &SqlitePool,
        identity: &EmbeddingIdentity,
        text: &str,
        vector: &[f32],
    ) -> EngineResult<()> {
        let (full_key, text_hash) = Self::cache_key(identity, text);
        self.memory_put(full_key, vector.to_vec());

        let vector_json = serde_json::to_string(vector)?;
        sqlx::query(
            "INSERT OR REPLACE INTO embedding_cache (model_key, text_hash, vector_json, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(identity.key())
        .bind(&text_hash)
        .bind(&vector_json)
        .bind(now_ts())
        .execute(pool)
        .await
        .map_err(mnemo_db::DbError::from)?;
        Ok(())
    }

    fn memory_get(&self, key: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock().ok()?;
        let hit = inner.map.get(key).cloned()?;
        // Refresh recency.
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            let k = inner.order.remove(pos);
            inner.order.push(k);
        }
        Some(hit)
    }

    fn memory_put(&self, key: String, vector: Vec<f32>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.map.insert(key.clone(), vector).is_none() {
            inner.order.push(key);
        }
        while inner.map.len() > self.capacity {
            let Some(oldest) = inner.order.first().cloned() else {
                break;
            };
            inner.order.remove(0);
            inner.map.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> EmbeddingIdentity {
        EmbeddingIdentity {
            provider: "test".into(),
            model: "stub".into(),
            dimension: 3,
        }
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = EmbeddingCache::new(2);
        let id = identity();
        let (k1, _) = EmbeddingCache::cache_key(&id, "one");
        let (k2, _) = EmbeddingCache::cache_key(&id, "two");
        let (k3, _) = EmbeddingCache::cache_key(&id, "three");

        cache.memory_put(k1.clone(), vec![1.0]);
        cache.memory_put(k2.clone(), vec![2.0]);
        // Touch k1 so k2 is the eviction candidate.
        cache.memory_get(&k1);
        cache.memory_put(k3.clone(), vec![3.0]);

        assert!(cache.memory_get(&k1).is_some());
        assert!(cache.memory_get(&k2).is_none());
        assert!(cache.memory_get(&k3).is_some());
    }

    #[test]
    fn keys_differ_by_identity() {
        let a = EmbeddingCache::cache_key(&identity(), "text").0;
        let mut other = identity();
        other.dimension = 9;
        let b = EmbeddingCache::cache_key(&other, "text").0;
        assert_ne!(a, b);
    }
}
