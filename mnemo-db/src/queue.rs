//! Durable FIFO of deferred work with claim-and-ack semantics.
//!
//! Claims are atomic: a BEGIN IMMEDIATE transaction selects and marks
//! tasks in one step, so concurrent workers cannot grab the same rows.
//! A claim carries both a database marker (survives crashes, recovered
//! by expiry) and an in-memory id set (blocks double-claim within the
//! process). At most one task per doc_id is in flight at a time, so
//! background work can never reorder past a foreground write for the
//! same document.
//!
//! Failed tasks retry with exponential backoff. Tasks that exhaust
//! their attempts move to 'failed' (dead letter) and are preserved with
//! the error for diagnosis.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use mnemo_core::time::{format_ts, now_ts};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::DbResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Summarize,
    Analyze,
    Embed,
    Reembed,
    Ocr,
    BackfillEdges,
    TagClassify,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::Analyze => "analyze",
            Self::Embed => "embed",
            Self::Reembed => "reembed",
            Self::Ocr => "ocr",
            Self::BackfillEdges => "backfill-edges",
            Self::TagClassify => "tag-classify",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summarize" => Ok(Self::Summarize),
            "analyze" => Ok(Self::Analyze),
            "embed" => Ok(Self::Embed),
            "reembed" => Ok(Self::Reembed),
            "ocr" => Ok(Self::Ocr),
            "backfill-edges" => Ok(Self::BackfillEdges),
            "tag-classify" => Ok(Self::TagClassify),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claimed work item.
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub id: i64,
    pub doc_id: String,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub enqueued_at: String,
}

/// What happened to a nacked task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Returned to pending; retry not before the given timestamp.
    Requeued { retry_after: String },
    /// Attempts exhausted; moved to the dead letter state.
    DeadLettered,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub claim_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_base_secs: u64,
    pub retry_backoff_max_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            claim_timeout_secs: 600,
            max_attempts: 5,
            retry_backoff_base_secs: 30,
            retry_backoff_max_secs: 3600,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct QueueStats {
    pub pending: u32,
    pub processing: u32,
    pub failed: u32,
    pub by_kind: Vec<(String, u32)>,
}

#[derive(Debug, Clone)]
pub struct FailedTask {
    pub doc_id: String,
    pub kind: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: String,
}

#[derive(Debug)]
pub struct PendingQueue {
    pool: SqlitePool,
    config: QueueConfig,
    claimed: Mutex<HashSet<i64>>,
}

impl PendingQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self {
            pool,
            config,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Add a task. An existing task for the same (doc_id, kind) is
    /// replaced and reset to pending.
    pub async fn enqueue(
        &self,
        doc_id: &str,
        kind: TaskKind,
        payload: &serde_json::Value,
    ) -> DbResult<()> {
        let payload_json = serde_json::to_string(payload)?;
        sqlx::query(
            r#"INSERT OR REPLACE INTO pending_tasks
               (doc_id, kind, payload, attempts, enqueued_at, status, claimed_by, claim_expires_at, last_error, retry_after)
               VALUES (?, ?, ?, 0, ?, 'pending', NULL, NULL, NULL, NULL)"#,
        )
        .bind(doc_id)
        .bind(kind.as_str())
        .bind(&payload_json)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically claim up to `limit` of the oldest runnable tasks.
    ///
    /// Runnable: pending, past any retry backoff, and no other task for
    /// the same doc_id currently processing.
    pub async fn claim(&self, worker_id: &str, limit: usize) -> DbResult<Vec<PendingTask>> {
        let now = Utc::now();
        let now_str = format_ts(now);
        let expires = format_ts(now + Duration::seconds(self.config.claim_timeout_secs as i64));

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: DbResult<Vec<PendingTask>> = async {
            // Recover claims from crashed workers.
            let recovered = sqlx::query(
                r#"UPDATE pending_tasks
                   SET status = 'pending', claimed_by = NULL, claim_expires_at = NULL
                   WHERE status = 'processing' AND claim_expires_at IS NOT NULL AND claim_expires_at < ?"#,
            )
            .bind(&now_str)
            .execute(&mut *conn)
            .await?
            .rows_affected();
            if recovered > 0 {
                info!("recovered {recovered} stale task claims");
            }

            let rows: Vec<(i64, String, String, String, i64, String)> = sqlx::query_as(
                r#"SELECT id, doc_id, kind, payload, attempts, enqueued_at
                   FROM pending_tasks
                   WHERE status = 'pending'
                     AND (retry_after IS NULL OR retry_after <= ?)
                     AND doc_id NOT IN (SELECT doc_id FROM pending_tasks WHERE status = 'processing')
                   ORDER BY enqueued_at ASC, id ASC
                   LIMIT ?"#,
            )
            .bind(&now_str)
            .bind(limit as i64)
            .fetch_all(&mut *conn)
            .await?;

            let mut tasks = Vec::new();
            let mut seen_docs: HashSet<String> = HashSet::new();
            for (id, doc_id, kind, payload, attempts, enqueued_at) in rows {
                // One in-flight task per doc, even within a single claim
                // batch; skip anything this process already holds.
                let already_held = self
                    .claimed
                    .lock()
                    .map(|claimed| claimed.contains(&id))
                    .unwrap_or(false);
                if already_held || !seen_docs.insert(doc_id.clone()) {
                    continue;
                }
                let Ok(kind) = kind.parse::<TaskKind>() else {
                    warn!("dropping task with unknown kind: {kind}");
                    continue;
                };
                tasks.push(PendingTask {
                    id,
                    doc_id,
                    kind,
                    payload: serde_json::from_str(&payload).unwrap_or_default(),
                    attempts: attempts as u32 + 1,
                    enqueued_at,
                });
            }

            for task in &tasks {
                sqlx::query(
                    r#"UPDATE pending_tasks
                       SET status = 'processing', claimed_by = ?, claim_expires_at = ?, attempts = attempts + 1
                       WHERE id = ?"#,
                )
                .bind(worker_id)
                .bind(&expires)
                .bind(task.id)
                .execute(&mut *conn)
                .await?;
            }

            Ok(tasks)
        }
        .await;

        match result {
            Ok(tasks) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                // The database markers are durable; only now mirror them
                // in the in-process set.
                if let Ok(mut claimed) = self.claimed.lock() {
                    claimed.extend(tasks.iter().map(|t| t.id));
                }
                Ok(tasks)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    /// Remove a task after successful processing.
    pub async fn ack(&self, task: &PendingTask) -> DbResult<()> {
        sqlx::query("DELETE FROM pending_tasks WHERE id = ?")
            .bind(task.id)
            .execute(&self.pool)
            .await?;
        self.release(task.id);
        Ok(())
    }

    /// Release a failed task: requeue with backoff, or dead-letter once
    /// the attempt cap is reached.
    pub async fn nack(&self, task: &PendingTask, error: &str) -> DbResult<NackOutcome> {
        self.release(task.id);

        if task.attempts >= self.config.max_attempts {
            sqlx::query(
                r#"UPDATE pending_tasks
                   SET status = 'failed', claimed_by = NULL, claim_expires_at = NULL, last_error = ?
                   WHERE id = ?"#,
            )
            .bind(error)
            .bind(task.id)
            .execute(&self.pool)
            .await?;
            warn!(
                "abandoned {} task for {} after {} attempts: {error}",
                task.kind, task.doc_id, task.attempts
            );
            return Ok(NackOutcome::DeadLettered);
        }

        let delay = self
            .config
            .retry_backoff_base_secs
            .saturating_mul(1u64 << (task.attempts.saturating_sub(1)).min(20))
            .min(self.config.retry_backoff_max_secs);
        let retry_after = format_ts(Utc::now() + Duration::seconds(delay as i64));

        sqlx::query(
            r#"UPDATE pending_tasks
               SET status = 'pending', claimed_by = NULL, claim_expires_at = NULL,
                   last_error = ?, retry_after = ?
               WHERE id = ?"#,
        )
        .bind(error)
        .bind(&retry_after)
        .bind(task.id)
        .execute(&self.pool)
        .await?;
        info!(
            "{} task for {} failed (attempt {}), retry after {delay}s: {error}",
            task.kind, task.doc_id, task.attempts
        );
        Ok(NackOutcome::Requeued { retry_after })
    }

    /// Move a task straight to the dead letter state, bypassing retries.
    /// For non-retryable failures.
    pub async fn dead_letter(&self, task: &PendingTask, error: &str) -> DbResult<()> {
        self.release(task.id);
        sqlx::query(
            r#"UPDATE pending_tasks
               SET status = 'failed', claimed_by = NULL, claim_expires_at = NULL, last_error = ?
               WHERE id = ?"#,
        )
        .bind(error)
        .bind(task.id)
        .execute(&self.pool)
        .await?;
        warn!("dead-lettered {} task for {}: {error}", task.kind, task.doc_id);
        Ok(())
    }

    fn release(&self, task_id: i64) {
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.remove(&task_id);
        }
    }

    /// Count of runnable items (excludes processing and failed).
    pub async fn count(&self) -> DbResult<u32> {
        let (n,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pending_tasks WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(n as u32)
    }

    pub async fn stats(&self) -> DbResult<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM pending_tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut stats = QueueStats::default();
        for (status, n) in rows {
            match status.as_str() {
                "pending" => stats.pending = n as u32,
                "processing" => stats.processing = n as u32,
                "failed" => stats.failed = n as u32,
                _ => {}
            }
        }
        let by_kind: Vec<(String, i64)> = sqlx::query_as(
            r#"SELECT kind, COUNT(*) FROM pending_tasks
               WHERE status IN ('pending', 'processing')
               GROUP BY kind ORDER BY COUNT(*) DESC"#,
        )
        .fetch_all(&self.pool)
        .await?;
        stats.by_kind = by_kind.into_iter().map(|(k, n)| (k, n as u32)).collect();
        Ok(stats)
    }

    /// Pending or processing work for a specific document.
    pub async fn status_for(&self, doc_id: &str) -> DbResult<Option<(String, String)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT kind, status FROM pending_tasks WHERE doc_id = ? AND status IN ('pending', 'processing') LIMIT 1",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_failed(&self) -> DbResult<Vec<FailedTask>> {
        let rows: Vec<(String, String, i64, Option<String>, String)> = sqlx::query_as(
            r#"SELECT doc_id, kind, attempts, last_error, enqueued_at
               FROM pending_tasks WHERE status = 'failed' ORDER BY enqueued_at ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(doc_id, kind, attempts, last_error, enqueued_at)| FailedTask {
                doc_id,
                kind,
                attempts: attempts as u32,
                last_error,
                enqueued_at,
            })
            .collect())
    }

    /// Reset all failed items to pending with fresh attempt counters.
    pub async fn retry_failed(&self) -> DbResult<u32> {
        let result = sqlx::query(
            r#"UPDATE pending_tasks
               SET status = 'pending', attempts = 0, claimed_by = NULL,
                   claim_expires_at = NULL, last_error = NULL, retry_after = NULL
               WHERE status = 'failed'"#,
        )
        .execute(&self.pool)
        .await?;
        let n = result.rows_affected() as u32;
        if n > 0 {
            info!("reset {n} failed tasks back to pending");
        }
        Ok(n)
    }

    pub async fn clear(&self) -> DbResult<u32> {
        let result = sqlx::query("DELETE FROM pending_tasks")
            .execute(&self.pool)
            .await?;
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.clear();
        }
        Ok(result.rows_affected() as u32)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
