//! Export and import.
//!
//! Export is a record sequence: a header, then one self-contained
//! record per document with versions and parts inlined. Embeddings are
//! never exported; import enqueues reembed tasks instead.

use mnemo_core::tags::TagMap;
use mnemo_core::time::now_ts;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mnemo_db::documents::{self, DocumentWrite};
use mnemo_db::edges::EdgeDelta;
use mnemo_db::parts::{self, PartRecord};
use mnemo_db::{versions, TaskKind};

use crate::engine::MemoryEngine;
use crate::errors::{EngineError, EngineResult};

pub const EXPORT_FORMAT: &str = "mnemo-export";
pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Skip records whose id already exists.
    Merge,
    /// Clear both stores first.
    Replace,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportStats {
    pub imported: u32,
    pub skipped: u32,
    pub versions: u32,
    pub parts: u32,
    pub queued: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExportVersion {
    version: u32,
    summary: String,
    #[serde(default)]
    tags: TagMap,
    #[serde(default)]
    content_hash: Option<String>,
    created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExportPart {
    part_num: u32,
    summary: String,
    #[serde(default)]
    tags: TagMap,
    content: String,
    created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExportDocument {
    id: String,
    summary: String,
    #[serde(default)]
    tags: TagMap,
    #[serde(default)]
    content_hash: Option<String>,
    #[serde(default)]
    content_hash_full: Option<String>,
    created_at: String,
    updated_at: String,
    accessed_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    versions: Vec<ExportVersion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    parts: Vec<ExportPart>,
}

pub(crate) async fn export_records(
    engine: &MemoryEngine,
    include_system: bool,
) -> EngineResult<Vec<Value>> {
    let pool = engine.pool();
    let doc_ids = documents::list_ids(pool, include_system).await?;

    let mut version_count = 0u32;
    let mut part_count = 0u32;
    let mut docs: Vec<ExportDocument> = Vec::with_capacity(doc_ids.len());

    for doc_id in &doc_ids {
        let Some(record) = documents::get(pool, doc_id).await? else {
            continue;
        };

        let version_records = versions::list_versions(pool, doc_id, 10_000).await?;
        let export_versions: Vec<ExportVersion> = version_records
            .into_iter()
            .map(|v| ExportVersion {
                version: v.ordinal,
                summary: v.summary,
                tags: v.tags,
                content_hash: v.content_hash,
                created_at: v.created_at,
            })
            .collect();
        version_count += export_versions.len() as u32;

        let part_records = parts::list_parts(pool, doc_id).await?;
        let export_parts: Vec<ExportPart> = part_records
            .into_iter()
            .map(|p| ExportPart {
                part_num: p.part_num,
                summary: p.summary,
                tags: p.tags,
                content: p.content,
                created_at: p.created_at,
            })
            .collect();
        part_count += export_parts.len() as u32;

        docs.push(ExportDocument {
            id: record.id,
            summary: record.summary,
            tags: record.tags,
            content_hash: record.content_hash,
            content_hash_full: record.content_hash_full,
            created_at: record.created_at,
            updated_at: record.updated_at,
            accessed_at: record.accessed_at,
            versions: export_versions,
            parts: export_parts,
        });
    }

    let header = serde_json::json!({
        "format": EXPORT_FORMAT,
        "version": EXPORT_VERSION,
        "exported_at": now_ts(),
        "store_info": {
            "document_count": docs.len(),
            "version_count": version_count,
            "part_count": part_count,
        },
    });

    let mut records = Vec::with_capacity(docs.len() + 1);
    records.push(header);
    for doc in docs {
        records.push(serde_json::to_value(doc)?);
    }
    Ok(records)
}

/// Import an export dump: either the header-plus-`documents` object
/// form or a record array as produced by [`export_records`].
pub(crate) async fn import_data(
    engine: &MemoryEngine,
    data: &Value,
    mode: ImportMode,
) -> EngineResult<ImportStats> {
    let (header, documents_json): (&Value, Vec<Value>) = match data {
        Value::Array(records) => {
            let header = records
                .first()
                .ok_or_else(|| EngineError::InvalidInput("empty import".into()))?;
            (header, records[1..].to_vec())
        }
        Value::Object(map) => {
            let docs = map
                .get("documents")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            (data, docs)
        }
        _ => return Err(EngineError::InvalidInput("invalid export payload".into())),
    };

    if header.get("format").and_then(Value::as_str) != Some(EXPORT_FORMAT) {
        return Err(EngineError::InvalidInput(format!(
            "invalid export format (expected {EXPORT_FORMAT:?})"
        )));
    }
    let version = header.get("version").and_then(Value::as_u64).unwrap_or(0);
    if version > EXPORT_VERSION as u64 {
        return Err(EngineError::InvalidInput(format!(
            "export format version {version} is not supported (up to {EXPORT_VERSION})"
        )));
    }

    let _guard = engine.write_lock().lock().await;
    let pool = engine.pool();

    if mode == ImportMode::Replace {
        documents::clear_all(pool).await?;
        // The vector side is rebuilt entirely by reembed tasks.
        engine.vectors().clear().await?;
    }

    let mut stats = ImportStats::default();

    for doc_json in documents_json {
        let doc: ExportDocument = serde_json::from_value(doc_json)
            .map_err(|e| EngineError::InvalidInput(format!("malformed record: {e}")))?;

        if mode == ImportMode::Merge && documents::exists(pool, &doc.id).await? {
            stats.skipped += 1;
            continue;
        }

        let write = DocumentWrite {
            id: doc.id.clone(),
            summary: doc.summary.clone(),
            tags: doc.tags.clone(),
            content_hash: doc.content_hash.clone(),
            content_hash_full: doc.content_hash_full.clone(),
            created_at_override: Some(doc.created_at.clone()),
        };
        documents::insert_document(pool, &write, &EdgeDelta::default(), &doc.updated_at).await?;

        for v in &doc.versions {
            versions::insert_version(
                pool,
                &doc.id,
                v.version,
                &v.summary,
                &v.tags,
                v.content_hash.as_deref(),
                &v.created_at,
            )
            .await?;
            stats.versions += 1;

            engine
                .queue()
                .enqueue(
                    &mnemo_core::ids::version_key(&doc.id, v.version),
                    TaskKind::Reembed,
                    &serde_json::json!({ "content": v.summary }),
                )
                .await?;
        }

        if !doc.parts.is_empty() {
            let part_records: Vec<PartRecord> = doc
                .parts
                .iter()
                .map(|p| PartRecord {
                    doc_id: doc.id.clone(),
                    part_num: p.part_num,
                    summary: p.summary.clone(),
                    tags: p.tags.clone(),
                    content: p.content.clone(),
                    created_at: p.created_at.clone(),
                })
                .collect();
            parts::replace_parts(pool, &doc.id, &part_records).await?;
            stats.parts += part_records.len() as u32;
        }

        engine
            .queue()
            .enqueue(
                &doc.id,
                TaskKind::Reembed,
                &serde_json::json!({ "content": doc.summary }),
            )
            .await?;
        stats.imported += 1;
        stats.queued += 1;
    }

    // Edge rows are derived data; rebuild them from the imported tags.
    for (predicate, inverse) in crate::engine::meta::edge_keys(pool).await? {
        engine
            .queue()
            .enqueue(
                &format!(".tag/{predicate}"),
                TaskKind::BackfillEdges,
                &serde_json::json!({ "predicate": predicate, "inverse": inverse }),
            )
            .await?;
    }

    Ok(stats)
}
