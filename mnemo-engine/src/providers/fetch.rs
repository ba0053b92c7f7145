//! Document fetching for `file://`, plain-path, and http(s) URIs.

use std::path::Path;

use crate::errors::{EngineError, EngineResult};

/// A fetched document, regularized to text where possible.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub uri: String,
    pub content: String,
    pub content_type: Option<String>,
    /// File stat, for the local fast path (mtime_ns, size).
    pub file_stat: Option<(u128, u64)>,
    /// File birth time as a unix timestamp, when the platform reports it.
    pub birthtime_secs: Option<i64>,
}

pub async fn fetch(client: &reqwest::Client, uri: &str) -> EngineResult<FetchedDocument> {
    if let Some(path) = local_path(uri) {
        return fetch_file(uri, Path::new(&path)).await;
    }
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return fetch_http(client, uri).await;
    }
    Err(EngineError::InvalidInput(format!(
        "unsupported uri scheme: {uri}"
    )))
}

/// Stat a local file without reading it (fast-path change detection).
pub fn stat_file(uri: &str) -> Option<(u128, u64)> {
    let path = local_path(uri)?;
    let meta = std::fs::metadata(path).ok()?;
    let mtime_ns = meta
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_nanos();
    Some((mtime_ns, meta.len()))
}

fn local_path(uri: &str) -> Option<String> {
    if let Some(rest) = uri.strip_prefix("file://") {
        Some(rest.to_string())
    } else if uri.starts_with('/') {
        Some(uri.to_string())
    } else {
        None
    }
}

async fn fetch_file(uri: &str, path: &Path) -> EngineResult<FetchedDocument> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| EngineError::InvalidInput(format!("cannot read {}: {e}", path.display())))?;
    let meta = tokio::fs::metadata(path).await.ok();

    let file_stat = meta.as_ref().and_then(|m| {
        let mtime_ns = m
            .modified()
            .ok()?
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_nanos();
        Some((mtime_ns, m.len()))
    });
    let birthtime_secs = meta.as_ref().and_then(|m| {
        m.created()
            .ok()?
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs() as i64)
    });

    let content_type = guess_content_type(path);
    let content = match String::from_utf8(bytes) {
        Ok(text) => text,
        // Binary content keeps a placeholder; the ocr task replaces it
        // with extracted text or a media description later.
        Err(_) => String::new(),
    };

    Ok(FetchedDocument {
        uri: uri.to_string(),
        content,
        content_type,
        file_stat,
        birthtime_secs,
    })
}

async fn fetch_http(client: &reqwest::Client, uri: &str) -> EngineResult<FetchedDocument> {
    let response = client.get(uri).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::ProviderTransient(format!(
            "fetch failed: {status} for {uri}"
        )));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
    let bytes = response.bytes().await?;
    let content = String::from_utf8_lossy(&bytes).into_owned();

    Ok(FetchedDocument {
        uri: uri.to_string(),
        content,
        content_type,
        file_stat: None,
        birthtime_secs: None,
    })
}

fn guess_content_type(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let ct = match ext.as_str() {
        "txt" | "md" | "markdown" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => return None,
    };
    Some(ct.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_paths_are_detected() {
        assert_eq!(local_path("file:///tmp/x.md").as_deref(), Some("/tmp/x.md"));
        assert_eq!(local_path("/tmp/x.md").as_deref(), Some("/tmp/x.md"));
        assert!(local_path("https://example.com").is_none());
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(
            guess_content_type(Path::new("a.pdf")).as_deref(),
            Some("application/pdf")
        );
        assert_eq!(
            guess_content_type(Path::new("notes.md")).as_deref(),
            Some("text/plain")
        );
        assert!(guess_content_type(Path::new("mystery")).is_none());
    }
}
