//! The keeper facade: orchestrates the dual-store write protocol, the
//! retrieval pipeline, and the deferred work queue.

use std::sync::Arc;

use mnemo_core::config::{
    load_config_file, save_config_file, EmbeddingIdentity, StoreConfigFile, StoreSettings,
};
use mnemo_core::tags::TagMap;
use mnemo_core::time::now_ts;
use sqlx::SqlitePool;
use tracing::{info, warn};

use mnemo_db::queue::QueueConfig;
use mnemo_db::{store, MemoryStore, PendingQueue, VectorStore};

use crate::errors::EngineResult;
use crate::models::{DeepItem, FindRequest, Item, ItemContext, PartRef, PutRequest};
use crate::providers::ProviderRouter;

pub(crate) mod analyze;
pub(crate) mod edges;
pub(crate) mod find;
pub(crate) mod get;
pub(crate) mod meta;
pub(crate) mod now;
pub(crate) mod put;
pub(crate) mod system_docs;
pub(crate) mod transfer;
pub(crate) mod worker;

/// Environment variable prefix for auto-applied tags.
pub const ENV_TAG_PREFIX: &str = "MNEMO_TAG_";

pub struct MemoryEngine {
    settings: StoreSettings,
    store: MemoryStore,
    vectors: VectorStore,
    queue: Arc<PendingQueue>,
    providers: Arc<ProviderRouter>,
    /// One writer at a time per store. Readers go straight to the pool.
    write_lock: tokio::sync::Mutex<()>,
    env_tags: TagMap,
}

impl MemoryEngine {
    /// Open a store with providers built from settings.
    pub async fn open(settings: StoreSettings) -> EngineResult<Self> {
        let providers = ProviderRouter::new(settings.clone());
        Self::open_with_providers(settings, providers).await
    }

    /// Open a store with an explicit provider router (tests, embedding
    /// backends the settings cannot express).
    pub async fn open_with_providers(
        settings: StoreSettings,
        providers: ProviderRouter,
    ) -> EngineResult<Self> {
        let store = MemoryStore::open(&settings.db_path()).await?;

        let queue = Arc::new(PendingQueue::new(
            store.pool().clone(),
            QueueConfig {
                claim_timeout_secs: settings.claim_timeout_secs,
                max_attempts: settings.max_attempts,
                retry_backoff_base_secs: settings.retry_backoff_base_secs,
                retry_backoff_max_secs: settings.retry_backoff_max_secs,
            },
        ));

        let engine = Self {
            vectors: VectorStore::new(store.pool().clone()),
            env_tags: env_tags(),
            settings,
            store,
            queue,
            providers: Arc::new(providers),
            write_lock: tokio::sync::Mutex::new(()),
        };

        engine.ensure_config_file()?;
        system_docs::ensure_seeded(&engine).await?;
        engine.check_identity_at_open().await?;

        Ok(engine)
    }

    pub fn pool(&self) -> &SqlitePool {
        self.store.pool()
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn vectors(&self) -> &VectorStore {
        &self.vectors
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    pub fn providers(&self) -> &Arc<ProviderRouter> {
        &self.providers
    }

    pub(crate) fn env_tags(&self) -> &TagMap {
        &self.env_tags
    }

    pub(crate) fn write_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.write_lock
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    // ── Write path ──────────────────────────────────────────────────

    /// Store content or a fetched URI. See the module docs of
    /// [`put`](self::put) for the phase breakdown.
    pub async fn put(&self, request: PutRequest) -> EngineResult<Item> {
        put::put(self, request).await
    }

    /// Update tags without re-processing. Empty value deletes a tag.
    pub async fn tag(&self, id: &str, tags: &TagMap) -> EngineResult<Item> {
        put::tag(self, id, tags).await
    }

    /// Update tags on a single part.
    pub async fn tag_part(&self, id: &str, part_num: u32, tags: &TagMap) -> EngineResult<Item> {
        put::tag_part(self, id, part_num, tags).await
    }

    /// Delete a document from both stores. Returns false when absent.
    pub async fn delete(&self, id: &str, delete_versions: bool) -> EngineResult<bool> {
        put::delete(self, id, delete_versions).await
    }

    /// Promote the previous version back to current, or delete the
    /// document when no history remains. Returns the restored item.
    pub async fn revert(&self, id: &str) -> EngineResult<Option<Item>> {
        put::revert(self, id).await
    }

    // ── Read path ───────────────────────────────────────────────────

    /// Fetch by id (which may carry an `@v{offset}` / `@p{n}` suffix).
    pub async fn get(&self, id: &str) -> EngineResult<Option<Item>> {
        get::get(self, id).await
    }

    /// Fetch with a tag filter; a mismatch reads as not-found.
    pub async fn get_filtered(&self, id: &str, tags: &TagMap) -> EngineResult<Option<Item>> {
        get::get_filtered(self, id, tags).await
    }

    /// Assemble the full display context (similar, meta, edges,
    /// version nav, parts manifest).
    pub async fn get_context(
        &self,
        id: &str,
        version: Option<u32>,
    ) -> EngineResult<Option<ItemContext>> {
        get::get_context(self, id, version).await
    }

    pub async fn exists(&self, id: &str) -> EngineResult<bool> {
        Ok(mnemo_db::documents::exists(self.pool(), id).await?)
    }

    /// A specific version by offset (0 = current).
    pub async fn get_version(&self, id: &str, offset: u32) -> EngineResult<Option<Item>> {
        get::get_version(self, id, offset).await
    }

    /// Version history, newest archived first.
    pub async fn list_versions(&self, id: &str, limit: usize) -> EngineResult<Vec<Item>> {
        get::list_versions(self, id, limit).await
    }

    pub async fn get_part(&self, id: &str, part_num: u32) -> EngineResult<Option<Item>> {
        get::get_part(self, id, part_num).await
    }

    pub async fn list_parts(&self, id: &str) -> EngineResult<Vec<PartRef>> {
        get::list_parts(self, id).await
    }

    // ── Search ──────────────────────────────────────────────────────

    /// Semantic, lexical, or similar-to search with tag pre-filter,
    /// time window, and recency decay.
    pub async fn find(&self, request: FindRequest) -> EngineResult<Vec<Item>> {
        find::find(self, request).await
    }

    /// `find` plus a one-hop expansion over edges and similarity,
    /// trimmed to a token budget.
    pub async fn find_deep(
        &self,
        request: FindRequest,
        token_budget: usize,
    ) -> EngineResult<Vec<DeepItem>> {
        find::find_deep(self, request, token_budget).await
    }

    /// List items with composable filters (no embedding involved).
    pub async fn list_items(&self, filter: find::ListItemsRequest) -> EngineResult<Vec<Item>> {
        find::list_items(self, filter).await
    }

    /// Distinct tag keys, or values of one key.
    pub async fn list_tags(&self, key: Option<&str>) -> EngineResult<Vec<String>> {
        find::list_tags(self, key).await
    }

    // ── Nowdoc ──────────────────────────────────────────────────────

    /// The current-intentions singleton; auto-created on first read.
    pub async fn get_now(&self, scope: Option<&str>) -> EngineResult<Item> {
        now::get_now(self, scope).await
    }

    pub async fn set_now(
        &self,
        content: &str,
        scope: Option<&str>,
        tags: Option<TagMap>,
    ) -> EngineResult<Item> {
        now::set_now(self, content, scope, tags).await
    }

    /// Move matching versions from a source document into a named item.
    /// Returns the number of states moved.
    pub async fn move_versions(
        &self,
        target: &str,
        source: &str,
        tag_filter: Option<&TagMap>,
        only_current: bool,
    ) -> EngineResult<usize> {
        now::move_versions(self, target, source, tag_filter, only_current).await
    }

    // ── Analysis ────────────────────────────────────────────────────

    /// Decompose a document into parts synchronously.
    pub async fn analyze(
        &self,
        id: &str,
        guide_tags: &[String],
        force: bool,
    ) -> EngineResult<Vec<PartRef>> {
        analyze::analyze(self, id, guide_tags, force).await
    }

    /// Defer decomposition to the background queue.
    pub async fn enqueue_analyze(&self, id: &str, guide_tags: &[String]) -> EngineResult<()> {
        analyze::enqueue_analyze(self, id, guide_tags).await
    }

    // ── Transfer ────────────────────────────────────────────────────

    /// Export every document with versions and parts inlined. The first
    /// record is the header; suitable for line-delimited JSON output.
    pub async fn export_records(
        &self,
        include_system: bool,
    ) -> EngineResult<Vec<serde_json::Value>> {
        transfer::export_records(self, include_system).await
    }

    pub async fn import_data(
        &self,
        data: &serde_json::Value,
        mode: transfer::ImportMode,
    ) -> EngineResult<transfer::ImportStats> {
        transfer::import_data(self, data, mode).await
    }

    // ── Background work ─────────────────────────────────────────────

    /// Claim and run up to `limit` deferred tasks on this thread.
    pub async fn process_pending(&self, limit: usize) -> EngineResult<worker::ProcessStats> {
        worker::process_pending(self, limit).await
    }

    /// Drain the queue completely (tests, shutdown hooks).
    pub async fn drain_pending(&self) -> EngineResult<worker::ProcessStats> {
        worker::drain(self).await
    }

    pub async fn pending_count(&self) -> EngineResult<u32> {
        Ok(self.queue.count().await?)
    }

    pub async fn pending_stats(&self) -> EngineResult<mnemo_db::queue::QueueStats> {
        Ok(self.queue.stats().await?)
    }

    /// Pending work for one document: (kind, status), if any.
    pub async fn pending_status(&self, id: &str) -> EngineResult<Option<(String, String)>> {
        Ok(self.queue.status_for(id).await?)
    }

    /// Reset dead-lettered tasks to pending. Returns the count revived.
    pub async fn retry_failed(&self) -> EngineResult<u32> {
        Ok(self.queue.retry_failed().await?)
    }

    pub async fn count(&self) -> EngineResult<i64> {
        Ok(mnemo_db::documents::count(self.pool()).await?)
    }

    pub async fn count_versions(&self) -> EngineResult<i64> {
        Ok(mnemo_db::documents::count_versions_total(self.pool()).await?)
    }

    // ── Identity and reindexing ─────────────────────────────────────

    /// Stored embedding identity, if any vectors have been indexed.
    pub async fn embedding_identity(&self) -> EngineResult<Option<EmbeddingIdentity>> {
        let raw = store::get_meta(self.pool(), store::META_EMBEDDING_IDENTITY).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// Whether the store is rebuilding its vectors after a provider
    /// change. Search may return degraded results meanwhile.
    pub async fn is_reindexing(&self) -> EngineResult<bool> {
        Ok(store::get_meta(self.pool(), store::META_REINDEXING)
            .await?
            .is_some())
    }

    /// Compare a discovered identity against the stored one; on change,
    /// persist it, rebuild the vector table, and enqueue reembed work
    /// for every document, version, and part.
    pub(crate) async fn ensure_identity(&self, current: &EmbeddingIdentity) -> EngineResult<bool> {
        let stored = self.embedding_identity().await?;
        match stored {
            None => {
                info!("recording embedding identity: {current}");
                store::set_meta(
                    self.pool(),
                    store::META_EMBEDDING_IDENTITY,
                    &serde_json::to_string(current)?,
                )
                .await?;
                store::ensure_vec_table(self.pool(), current.dimension).await?;
                Ok(false)
            }
            Some(stored) if stored == *current => Ok(false),
            Some(stored) => {
                warn!("embedding provider changed: {stored} -> {current}");
                store::set_meta(
                    self.pool(),
                    store::META_EMBEDDING_IDENTITY,
                    &serde_json::to_string(current)?,
                )
                .await?;
                store::reset_vec_table(self.pool(), current.dimension).await?;
                store::set_meta(self.pool(), store::META_REINDEXING, "true").await?;
                let enqueued = worker::enqueue_reindex(self).await?;
                info!("enqueued {enqueued} entities for reindex");
                Ok(true)
            }
        }
    }

    async fn check_identity_at_open(&self) -> EngineResult<()> {
        // Only act at open when the declared settings pin a dimension;
        // otherwise the identity is discovered on first embed.
        let current = self.providers.embedding_identity();
        if current.dimension == 0 {
            return Ok(());
        }
        if self.embedding_identity().await?.is_some() {
            self.ensure_identity(&current).await?;
        }
        Ok(())
    }

    fn ensure_config_file(&self) -> EngineResult<()> {
        let path = self.settings.config_path();
        if load_config_file(&path)?.is_none() {
            let mut config = StoreConfigFile::default();
            config.store.version = 1;
            config.store.created = now_ts();
            save_config_file(&path, &config)?;
        }
        Ok(())
    }

    pub(crate) fn config_file(&self) -> EngineResult<StoreConfigFile> {
        Ok(load_config_file(&self.settings.config_path())?.unwrap_or_default())
    }

    pub(crate) fn save_config(&self, config: &StoreConfigFile) -> EngineResult<()> {
        save_config_file(&self.settings.config_path(), config)?;
        Ok(())
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("store_path", &self.settings.store_path)
            .finish()
    }
}

/// Collect tags from `MNEMO_TAG_*` environment variables.
/// `MNEMO_TAG_PROJECT=foo` becomes `project=foo`.
fn env_tags() -> TagMap {
    let mut tags = TagMap::new();
    for (key, value) in std::env::vars() {
        if let Some(name) = key.strip_prefix(ENV_TAG_PREFIX) {
            if !value.is_empty() && !name.is_empty() {
                tags.insert(name.to_lowercase(), value);
            }
        }
    }
    tags
}
