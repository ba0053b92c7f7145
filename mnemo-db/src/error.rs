//! Storage error types.

/// Storage operation errors
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// SQL error from sqlx
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite-vec initialization error
    #[error("SQLite-vec initialization error: {0}")]
    SqliteVec(String),

    /// Vector dimension does not match the pinned collection dimension
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Vector table not initialized (no dimension pinned yet)
    #[error("vector table not initialized")]
    VectorTableMissing,

    /// Tag or payload serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type alias for storage operations
pub type DbResult<T> = Result<T, DbError>;
