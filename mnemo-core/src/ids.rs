//! Identifier validation, normalization, and entity addressing.
//!
//! Four id families share one namespace:
//! - content-addressed text: `%` + first 12 hex of a SHA-256 digest
//! - URI-addressed: the full normalized URI (`file://`, `http(s)://`)
//! - named: any plain string (`now`, user-created objects)
//! - system: ids starting with `.` (`.tag/act`, `.meta/todo`)
//!
//! Versions and parts are addressed with an `@v{n}` / `@p{n}` suffix.
//! The suffix is decoded once at the boundary into an [`EntityKey`] and
//! flows as a typed value inward.

use sha2::{Digest, Sha256};

pub const MAX_ID_LENGTH: usize = 1024;

/// Fixed id for the current-intentions singleton.
pub const NOWDOC_ID: &str = "now";

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("id must be 1-{MAX_ID_LENGTH} characters")]
    Length,
    #[error("id contains invalid characters: {0:?}")]
    Chars(String),
}

/// Blocked in ids: control chars plus a small shell/markup blocklist.
fn is_blocked_char(c: char) -> bool {
    c.is_control() || matches!(c, '\\' | '`' | '<' | '>' | '|' | ';' | '"' | '\'')
}

pub fn validate_id(id: &str) -> Result<(), IdError> {
    if id.is_empty() || id.len() > MAX_ID_LENGTH {
        return Err(IdError::Length);
    }
    if id.chars().any(is_blocked_char) {
        return Err(IdError::Chars(id.to_string()));
    }
    Ok(())
}

/// Whether an id names a system document (dot prefix).
pub fn is_system_id(id: &str) -> bool {
    id.starts_with('.')
}

/// Nowdoc id, optionally scoped for multi-user isolation.
pub fn nowdoc_id(scope: Option<&str>) -> String {
    match scope {
        Some(s) => format!("now:{s}"),
        None => NOWDOC_ID.to_string(),
    }
}

/// Short content hash used for change detection (last 10 hex).
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let hex = format!("{digest:x}");
    hex[hex.len() - 10..].to_string()
}

/// Full content hash used for dedup verification.
pub fn content_hash_full(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Content-addressed id for inline text: same content, same id.
pub fn text_content_id(content: &str) -> String {
    let hex = format!("{:x}", Sha256::digest(content.as_bytes()));
    format!("%{}", &hex[..12])
}

// ── Entity addressing ───────────────────────────────────────────────

/// A decoded storage address: the current document, an archived version,
/// or a structural part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Doc(String),
    Version { doc_id: String, ordinal: u32 },
    Part { doc_id: String, part_num: u32 },
}

impl EntityKey {
    /// Parse an id with an optional `@v{n}` / `@V{n}` / `@p{n}` / `@P{n}`
    /// suffix. Braces around the number are accepted (`@P{3}`).
    pub fn parse(id: &str) -> Self {
        if let Some((base, kind, num)) = split_suffix(id) {
            return match kind {
                SuffixKind::Version => EntityKey::Version { doc_id: base.to_string(), ordinal: num },
                SuffixKind::Part => EntityKey::Part { doc_id: base.to_string(), part_num: num },
            };
        }
        EntityKey::Doc(id.to_string())
    }

    /// The base document id this key addresses.
    pub fn doc_id(&self) -> &str {
        match self {
            EntityKey::Doc(id) => id,
            EntityKey::Version { doc_id, .. } | EntityKey::Part { doc_id, .. } => doc_id,
        }
    }

    /// Canonical storage key string (`id`, `id@v3`, `id@p2`).
    pub fn storage_key(&self) -> String {
        match self {
            EntityKey::Doc(id) => id.clone(),
            EntityKey::Version { doc_id, ordinal } => format!("{doc_id}@v{ordinal}"),
            EntityKey::Part { doc_id, part_num } => format!("{doc_id}@p{part_num}"),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.storage_key())
    }
}

enum SuffixKind {
    Version,
    Part,
}

fn split_suffix(id: &str) -> Option<(&str, SuffixKind, u32)> {
    let at = id.rfind('@')?;
    let (base, rest) = (&id[..at], &id[at + 1..]);
    if base.is_empty() {
        return None;
    }
    let mut chars = rest.chars();
    let kind = match chars.next()? {
        'v' | 'V' => SuffixKind::Version,
        'p' | 'P' => SuffixKind::Part,
        _ => return None,
    };
    let digits = chars.as_str();
    let digits = digits
        .strip_prefix('{')
        .and_then(|d| d.strip_suffix('}'))
        .unwrap_or(digits);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let num = digits.parse().ok()?;
    Some((base, kind, num))
}

/// Whether an id carries a part suffix (parts are immutable through put).
pub fn is_part_id(id: &str) -> bool {
    matches!(EntityKey::parse(id), EntityKey::Part { .. })
}

/// Composite storage key for an archived version's embedding.
pub fn version_key(doc_id: &str, ordinal: u32) -> String {
    format!("{doc_id}@v{ordinal}")
}

/// Composite storage key for a part's embedding.
pub fn part_key(doc_id: &str, part_num: u32) -> String {
    format!("{doc_id}@p{part_num}")
}

// ── URI normalization (RFC 3986 §6.2.2) ─────────────────────────────

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

/// Decode percent-encoded unreserved characters; uppercase retained
/// escapes (RFC 3986 §2.3).
fn decode_unreserved(s: &str) -> String {
    if !s.contains('%') || !s.is_ascii() {
        return s.to_string();
    }
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &s[i + 1..i + 3];
            if let Ok(code) = u8::from_str_radix(hex, 16) {
                let c = code as char;
                if is_unreserved(c) {
                    out.push(c);
                } else {
                    out.push('%');
                    out.push_str(&hex.to_uppercase());
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Remove `.` and `..` segments from a URI path (RFC 3986 §5.2.4).
fn resolve_dot_segments(path: &str) -> String {
    let mut output: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "." => {}
            ".." => {
                if matches!(output.last(), Some(last) if !last.is_empty()) {
                    output.pop();
                }
            }
            other => output.push(other),
        }
    }
    let resolved = output.join("/");
    if path.starts_with('/') && !resolved.starts_with('/') {
        format!("/{resolved}")
    } else {
        resolved
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

fn normalize_http_uri(uri: &str) -> String {
    let Some(scheme_end) = uri.find("://") else {
        return uri.to_string();
    };
    let scheme = uri[..scheme_end].to_lowercase();
    let rest = &uri[scheme_end + 3..];

    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    let tail = &rest[authority_end..];

    // Split userinfo from host:port
    let (userinfo, hostport) = match authority.rsplit_once('@') {
        Some((u, h)) => (Some(u), h),
        None => (None, authority),
    };
    let (host, port) = match hostport.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
            (h, p.parse::<u16>().ok())
        }
        _ => (hostport, None),
    };
    let host = host.to_lowercase();
    let port = port.filter(|p| Some(*p) != default_port(&scheme));

    let mut netloc = String::new();
    if let Some(u) = userinfo {
        netloc.push_str(u);
        netloc.push('@');
    }
    netloc.push_str(&host);
    if let Some(p) = port {
        netloc.push(':');
        netloc.push_str(&p.to_string());
    }

    let (path_query, fragment) = match tail.split_once('#') {
        Some((pq, f)) => (pq, Some(f)),
        None => (tail, None),
    };
    let (path, query) = match path_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_query, None),
    };

    let mut path = resolve_dot_segments(&decode_unreserved(path));
    if path.is_empty() {
        path.push('/');
    }

    let mut out = format!("{scheme}://{netloc}{path}");
    if let Some(q) = query {
        out.push('?');
        out.push_str(&decode_unreserved(q));
    }
    if let Some(f) = fragment {
        out.push('#');
        out.push_str(&decode_unreserved(f));
    }
    out
}

/// Validate and normalize a document id. HTTP/HTTPS URIs get syntax-based
/// normalization so equivalent spellings map to the same document; all
/// other ids are validated only.
pub fn normalize_id(id: &str) -> Result<String, IdError> {
    validate_id(id)?;
    let lower = id[..id.len().min(8)].to_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(normalize_http_uri(id));
    }
    Ok(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_is_stable() {
        let a = text_content_id("rate limit is 100 req/min");
        let b = text_content_id("rate limit is 100 req/min");
        assert_eq!(a, b);
        assert!(a.starts_with('%'));
        assert_eq!(a.len(), 13);
        assert_ne!(a, text_content_id("different note"));
    }

    #[test]
    fn entity_key_round_trip() {
        assert_eq!(EntityKey::parse("doc"), EntityKey::Doc("doc".into()));
        assert_eq!(
            EntityKey::parse("doc@v3"),
            EntityKey::Version { doc_id: "doc".into(), ordinal: 3 }
        );
        assert_eq!(
            EntityKey::parse("doc@P{2}"),
            EntityKey::Part { doc_id: "doc".into(), part_num: 2 }
        );
        assert_eq!(EntityKey::parse("doc@v3").storage_key(), "doc@v3");
        // An @ without a valid suffix stays a plain id
        assert_eq!(EntityKey::parse("mail@example"), EntityKey::Doc("mail@example".into()));
    }

    #[test]
    fn id_validation_blocks_shell_chars() {
        assert!(validate_id("now").is_ok());
        assert!(validate_id(".tag/act").is_ok());
        assert!(validate_id("a;b").is_err());
        assert!(validate_id("a`b").is_err());
        assert!(validate_id("").is_err());
    }

    #[test]
    fn http_normalization() {
        assert_eq!(
            normalize_id("HTTP://Example.COM:80/a/./b/../c").unwrap(),
            "http://example.com/a/c"
        );
        assert_eq!(
            normalize_id("https://example.com").unwrap(),
            "https://example.com/"
        );
        assert_eq!(
            normalize_id("https://example.com/%7Euser").unwrap(),
            "https://example.com/~user"
        );
        // Non-http ids pass through untouched
        assert_eq!(normalize_id("file:///tmp/x.md").unwrap(), "file:///tmp/x.md");
    }
}
