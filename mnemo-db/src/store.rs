//! Database connection pool and initialization.

use std::path::Path;
use std::sync::OnceLock;

use libsqlite3_sys::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension, SQLITE_OK};
use sqlite_vec::sqlite3_vec_init;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{DbError, DbResult};

static SQLITE_VEC_INIT_RC: OnceLock<i32> = OnceLock::new();

pub const META_EMBEDDING_DIM: &str = "embedding_dim";
pub const META_EMBEDDING_IDENTITY: &str = "embedding_identity";
pub const META_REINDEXING: &str = "reindexing";

/// Database pool wrapper. Holds both the document and vector sides of
/// the store; they share one SQLite file so cross-store writes can run
/// under a single WAL.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    pool: SqlitePool,
}

impl MemoryStore {
    /// Open (or create) a store at the given path and run migrations.
    pub async fn open(db_path: &Path) -> DbResult<Self> {
        init_sqlite_vec_once()?;

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode = WAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous = NORMAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA cache_size = -64000")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        run_migrations(&pool).await?;
        info!("store opened at {}", db_path.display());

        Ok(Self { pool })
    }

    /// Access the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn init_sqlite_vec_once() -> DbResult<()> {
    let rc = *SQLITE_VEC_INIT_RC.get_or_init(|| unsafe {
        type SqliteVecInitFn =
            unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;

        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), SqliteVecInitFn>(
            sqlite3_vec_init as *const (),
        )))
    });

    if rc == SQLITE_OK {
        Ok(())
    } else {
        Err(DbError::SqliteVec(format!(
            "sqlite-vec init failed with code {rc}"
        )))
    }
}

pub(crate) async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    let migration_sql = include_str!("../migrations/001_initial.sql");

    for statement in migration_sql.split(';') {
        let stmt = statement.trim();
        if !stmt.is_empty() {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .map_err(|e| DbError::Migration(format!("failed to execute migration: {e}")))?;
        }
    }

    Ok(())
}

// ── Store meta ──────────────────────────────────────────────────────

pub async fn get_meta(pool: &SqlitePool, key: &str) -> DbResult<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM store_meta WHERE key = ? LIMIT 1")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(value,)| value))
}

pub async fn set_meta(pool: &SqlitePool, key: &str, value: &str) -> DbResult<()> {
    sqlx::query("INSERT OR REPLACE INTO store_meta (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_meta(pool: &SqlitePool, key: &str) -> DbResult<()> {
    sqlx::query("DELETE FROM store_meta WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Vector table lifecycle ──────────────────────────────────────────

/// The pinned vector dimension, if any vectors have been written yet.
pub async fn vector_dimension(pool: &SqlitePool) -> DbResult<Option<usize>> {
    Ok(get_meta(pool, META_EMBEDDING_DIM)
        .await?
        .and_then(|v| v.parse().ok()))
}

/// Create the vec0 table for the given dimension if it does not exist,
/// and pin the dimension in store meta. Mixing dimensions is forbidden:
/// a differing pinned dimension is a hard error (reindex required).
pub async fn ensure_vec_table(pool: &SqlitePool, dimension: usize) -> DbResult<()> {
    if let Some(pinned) = vector_dimension(pool).await? {
        if pinned != dimension {
            return Err(DbError::DimensionMismatch {
                expected: pinned,
                actual: dimension,
            });
        }
    }

    let table_exists: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'doc_vec'",
    )
    .fetch_optional(pool)
    .await?;

    if table_exists.is_none() {
        let create_sql = format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS doc_vec USING vec0(embedding float[{}] distance_metric=cosine)",
            dimension
        );
        sqlx::query(&create_sql).execute(pool).await?;
    }

    set_meta(pool, META_EMBEDDING_DIM, &dimension.to_string()).await?;
    Ok(())
}

/// Drop and recreate the vector table for a new dimension. Used by the
/// reindex transition when the embedding identity changes.
pub async fn reset_vec_table(pool: &SqlitePool, dimension: usize) -> DbResult<()> {
    info!("resetting vector table for dimension {dimension}");
    sqlx::query("DROP TABLE IF EXISTS doc_vec")
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM embeddings").execute(pool).await?;
    delete_meta(pool, META_EMBEDDING_DIM).await?;
    ensure_vec_table(pool, dimension).await
}
