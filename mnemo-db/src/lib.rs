//! SQLite persistence for the mnemo memory engine.
//!
//! One database file carries both sides of the dual store: the canonical
//! document tables (documents, versions, parts, tags, edges) and the
//! embedding index (metadata rows plus a sqlite-vec table), along with
//! the durable pending-work queue. Sharing a file keeps the write
//! protocol's phase ordering observable under WAL.

pub mod documents;
pub mod edges;
pub mod error;
pub mod parts;
pub mod queue;
pub mod store;
pub mod test_helpers;
pub mod vectors;
pub mod versions;

pub use documents::{DocumentRecord, DocumentWrite, ListFilter, ListOrder};
pub use edges::{EdgeAdd, EdgeDelta, EdgeRecord, InverseEdge};
pub use error::{DbError, DbResult};
pub use parts::PartRecord;
pub use queue::{NackOutcome, PendingQueue, PendingTask, QueueConfig, TaskKind};
pub use store::MemoryStore;
pub use vectors::{EmbeddingRecord, VectorFilter, VectorHit, VectorStore};
pub use versions::{ExtractResult, ExtractedState, VersionRecord};
