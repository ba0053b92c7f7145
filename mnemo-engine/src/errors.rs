//! Engine error taxonomy.
//!
//! Errors are structured values. Foreground lookups return `Ok(None)`
//! for missing documents; operations that require the document return
//! `NotFound`. Background workers classify provider errors into
//! transient (requeue with backoff) and fatal (dead letter).

use mnemo_core::config::ConfigError;
use mnemo_core::ids::IdError;
use mnemo_core::tags::TagError;
use mnemo_core::time::WhenParseError;
use mnemo_db::DbError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid value for constrained tag {key:?}: {value:?}. Valid values: {}", valid.join(", "))]
    TagConstraint {
        key: String,
        value: String,
        valid: Vec<String>,
    },

    #[error("no provider available for {0}")]
    ProviderUnavailable(&'static str),

    #[error("provider timed out: {0}")]
    ProviderTimeout(String),

    #[error("transient provider failure: {0}")]
    ProviderTransient(String),

    #[error("provider failure: {0}")]
    ProviderFatal(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("concurrent modification of {0}, retry")]
    ConcurrentModification(String),

    #[error("storage failure: {0}")]
    Storage(DbError),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    When(#[from] WhenParseError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::DimensionMismatch { expected, actual } => {
                EngineError::DimensionMismatch { expected, actual }
            }
            other => EngineError::Storage(other),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::ProviderTimeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            EngineError::ProviderTransient(err.to_string())
        } else {
            EngineError::ProviderFatal(err.to_string())
        }
    }
}

impl EngineError {
    /// Whether a background task hitting this error should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::ProviderTimeout(_)
                | EngineError::ProviderTransient(_)
                | EngineError::ProviderUnavailable(_)
                | EngineError::ConcurrentModification(_)
        )
    }

    /// Short kind label carried in `_error` tags on dead-lettered docs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid-input",
            EngineError::NotFound(_) => "not-found",
            EngineError::TagConstraint { .. } => "tag-constraint",
            EngineError::ProviderUnavailable(_) => "provider-unavailable",
            EngineError::ProviderTimeout(_) => "provider-timeout",
            EngineError::ProviderTransient(_) => "provider-transient",
            EngineError::ProviderFatal(_) => "provider-fatal",
            EngineError::DimensionMismatch { .. } => "dimension-mismatch",
            EngineError::ConcurrentModification(_) => "concurrent-modification",
            EngineError::Storage(_) => "storage",
            EngineError::Tag(_) => "tag",
            EngineError::Id(_) => "id",
            EngineError::When(_) => "when",
            EngineError::Config(_) => "config",
            EngineError::Serde(_) => "serde",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
