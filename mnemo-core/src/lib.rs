//! Shared types and configuration for the mnemo memory engine.

pub mod config;
pub mod ids;
pub mod tags;
pub mod time;

pub use config::{EmbeddingIdentity, EmbeddingProviderKind, StoreSettings};
pub use ids::{content_hash, content_hash_full, normalize_id, text_content_id, EntityKey};
pub use tags::{TagMap, SYSTEM_TAG_PREFIX};
