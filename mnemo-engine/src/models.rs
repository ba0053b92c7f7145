//! Read-model types returned by the engine.

use mnemo_core::tags::TagMap;
use mnemo_core::time::date_of;
use mnemo_db::{DocumentRecord, PartRecord, VersionRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An item retrieved from the store. A read-only snapshot: mutate
/// through `put` or `tag`, which return a fresh item.
///
/// Timestamps and other system metadata live in tags, not as explicit
/// fields ("schema as data"); the typed accessors below project the
/// common ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub summary: String,
    #[serde(default)]
    pub tags: TagMap,
    /// Similarity score; present only in search results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    /// Whether content changed on put; None for query results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed: Option<bool>,
}

impl Item {
    pub fn created(&self) -> Option<&str> {
        self.tags.get("_created").map(String::as_str)
    }

    pub fn updated(&self) -> Option<&str> {
        self.tags.get("_updated").map(String::as_str)
    }

    pub fn accessed(&self) -> Option<&str> {
        self.tags.get("_accessed").map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.tags.get("_content_type").map(String::as_str)
    }

    pub fn source(&self) -> Option<&str> {
        self.tags.get("_source").map(String::as_str)
    }
}

/// Convert a document record to an item with timestamp tags projected in.
pub fn record_to_item(rec: &DocumentRecord, score: Option<f32>, changed: Option<bool>) -> Item {
    let mut tags = rec.tags.clone();
    tags.insert("_created".into(), rec.created_at.clone());
    tags.insert("_updated".into(), rec.updated_at.clone());
    tags.insert("_updated_date".into(), date_of(&rec.updated_at));
    tags.insert("_accessed".into(), rec.accessed_at.clone());
    tags.insert("_accessed_date".into(), date_of(&rec.accessed_at));
    Item {
        id: rec.id.clone(),
        summary: rec.summary.clone(),
        tags,
        score,
        changed,
    }
}

pub fn version_to_item(doc_id: &str, v: &VersionRecord) -> Item {
    let mut tags = v.tags.clone();
    tags.insert("_version".into(), v.ordinal.to_string());
    tags.insert("_base_id".into(), doc_id.to_string());
    tags.insert("_created".into(), v.created_at.clone());
    Item {
        id: doc_id.to_string(),
        summary: v.summary.clone(),
        tags,
        score: None,
        changed: None,
    }
}

pub fn part_to_item(doc_id: &str, part: &PartRecord, total: u32) -> Item {
    let mut tags = part.tags.clone();
    tags.insert("_part_num".into(), part.part_num.to_string());
    tags.insert("_base_id".into(), doc_id.to_string());
    tags.insert("_total_parts".into(), total.to_string());
    Item {
        id: doc_id.to_string(),
        summary: if part.content.is_empty() {
            part.summary.clone()
        } else {
            part.content.clone()
        },
        tags,
        score: None,
        changed: None,
    }
}

// ── Display context ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarRef {
    pub id: String,
    /// Version offset of the hit (0 = current).
    pub offset: u32,
    pub score: Option<f32>,
    pub date: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaRef {
    pub id: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRef {
    /// Absolute offset (1 = previous, 2 = two ago).
    pub offset: u32,
    pub date: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartRef {
    pub part_num: u32,
    pub summary: String,
    #[serde(default)]
    pub tags: TagMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRef {
    pub source_id: String,
    pub summary: String,
    pub date: String,
}

/// Complete display context for a single item: the wire format shared
/// by every surface that renders a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemContext {
    pub item: Item,
    /// 0 = viewing the current version.
    pub viewing_offset: u32,
    #[serde(default)]
    pub similar: Vec<SimilarRef>,
    /// Meta-doc name → matched items.
    #[serde(default)]
    pub meta: BTreeMap<String, Vec<MetaRef>>,
    /// Inverse verb → documents pointing here.
    #[serde(default)]
    pub edges: BTreeMap<String, Vec<EdgeRef>>,
    #[serde(default)]
    pub parts: Vec<PartRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_part: Option<u32>,
    #[serde(default)]
    pub prev: Vec<VersionRef>,
    #[serde(default)]
    pub next: Vec<VersionRef>,
}

// ── Requests ────────────────────────────────────────────────────────

/// Input to `put`. Exactly one of `content` / `uri` must be set.
#[derive(Debug, Clone, Default)]
pub struct PutRequest {
    pub content: Option<String>,
    pub uri: Option<String>,
    pub id: Option<String>,
    pub summary: Option<String>,
    pub tags: Option<TagMap>,
    /// Override creation timestamp (RFC 3339) for historical imports.
    pub created_at: Option<String>,
}

impl PutRequest {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_tags(mut self, tags: TagMap) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags
            .get_or_insert_with(TagMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Input to `find`. Exactly one of `query` / `similar_to` must be set.
#[derive(Debug, Clone)]
pub struct FindRequest {
    pub query: Option<String>,
    pub similar_to: Option<String>,
    pub tags: TagMap,
    pub fulltext: bool,
    pub limit: usize,
    pub since: Option<String>,
    pub until: Option<String>,
    pub include_self: bool,
    pub include_system: bool,
}

impl Default for FindRequest {
    fn default() -> Self {
        Self {
            query: None,
            similar_to: None,
            tags: TagMap::new(),
            fulltext: false,
            limit: 10,
            since: None,
            until: None,
            include_self: false,
            include_system: false,
        }
    }
}

impl FindRequest {
    pub fn query(text: impl Into<String>) -> Self {
        Self {
            query: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn similar_to(id: impl Into<String>) -> Self {
        Self {
            similar_to: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// One item of a deep-find expansion, with its hop distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepItem {
    pub item: Item,
    pub depth: u8,
    /// Relation that led here ("hit", "edge:<predicate>", "similar").
    pub relation: String,
}
