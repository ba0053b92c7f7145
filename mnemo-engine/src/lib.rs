//! Reflective-memory core engine.
//!
//! A content-addressed, versioned document store coupled with an
//! embedding index behind one semantic-search API. Documents carry a
//! summary and tags (the original content is not stored); every
//! mutation archives the previous state; retrieval combines cosine
//! similarity, recency decay, and tag pre-filtering. Slow model work
//! (summarization, analysis, re-embedding) runs through a durable
//! queue so writes stay fast and nothing is lost on restart.

pub mod decay;
pub mod engine;
pub mod errors;
pub mod models;
pub mod providers;
pub mod testing;

pub use engine::find::ListItemsRequest;
pub use engine::transfer::{ImportMode, ImportStats};
pub use engine::worker::{spawn_workers, ProcessStats};
pub use engine::MemoryEngine;
pub use errors::{EngineError, EngineResult};
pub use models::{
    DeepItem, EdgeRef, FindRequest, Item, ItemContext, MetaRef, PartRef, PutRequest, SimilarRef,
    VersionRef,
};
pub use providers::{AnalyzedPart, Embedder, ProviderRouter, Summarizer};
