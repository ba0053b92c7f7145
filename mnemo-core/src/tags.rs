//! Tag map helpers and validation.
//!
//! Tags are a flat string-to-string mapping. Keys starting with `_` are
//! system-managed and stripped from user input before merge. Values keep
//! their original case for display; the vector index stores a casefolded
//! copy for case-insensitive filtering.

use std::collections::BTreeMap;

/// Ordered tag map. BTreeMap gives stable JSON output and cheap equality.
pub type TagMap = BTreeMap<String, String>;

/// Keys starting with this prefix are managed by the system.
pub const SYSTEM_TAG_PREFIX: char = '_';

/// Tags used internally but hidden from display output.
pub const INTERNAL_TAGS: &[&str] = &["_updated_date", "_accessed_date", "_focus_part"];

pub const MAX_TAG_KEY_LENGTH: usize = 128;
pub const MAX_TAG_VALUE_LENGTH: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("tag key must be 1-{MAX_TAG_KEY_LENGTH} characters: {0:?}")]
    KeyLength(String),
    #[error("tag key contains invalid characters (allowed: a-z, 0-9, _, -): {0:?}{1}")]
    KeyChars(String, String),
    #[error("tag value too long (max {MAX_TAG_VALUE_LENGTH}): {0:?}")]
    ValueLength(String),
}

pub fn is_system_key(key: &str) -> bool {
    key.starts_with(SYSTEM_TAG_PREFIX)
}

/// Validate a user tag key is safe for index queries.
pub fn validate_tag_key(key: &str) -> Result<(), TagError> {
    if key.is_empty() || key.len() > MAX_TAG_KEY_LENGTH {
        return Err(TagError::KeyLength(key.to_string()));
    }
    let mut chars = key.chars();
    let first = chars.next().unwrap();
    let head_ok = first.is_ascii_alphabetic() || first == '_';
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !head_ok || !tail_ok {
        let hint = if let Some((k, v)) = key.split_once(':') {
            format!(". Use separate key and value: tags={{{k:?}: {v:?}}}")
        } else {
            String::new()
        };
        return Err(TagError::KeyChars(key.to_string(), hint));
    }
    Ok(())
}

pub fn validate_tag_value(key: &str, value: &str) -> Result<(), TagError> {
    if value.len() > MAX_TAG_VALUE_LENGTH {
        return Err(TagError::ValueLength(key.to_string()));
    }
    Ok(())
}

/// Lowercase user tag keys for case-insensitive lookup, preserving values.
/// System tags are left untouched.
pub fn casefold_tags(tags: &TagMap) -> TagMap {
    tags.iter()
        .map(|(k, v)| {
            let key = if is_system_key(k) { k.clone() } else { k.to_lowercase() };
            (key, v.clone())
        })
        .collect()
}

/// Lowercase both keys and values for the vector index copy, where
/// filter matching is case-insensitive. Canonical display tags live in
/// the document store.
pub fn casefold_tags_for_index(tags: &TagMap) -> TagMap {
    tags.iter()
        .map(|(k, v)| {
            if is_system_key(k) {
                (k.clone(), v.clone())
            } else {
                (k.to_lowercase(), v.to_lowercase())
            }
        })
        .collect()
}

/// Strip system tags so user input cannot overwrite managed values.
pub fn filter_system_tags(tags: &TagMap) -> TagMap {
    tags.iter()
        .filter(|(k, _)| !is_system_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Whether the non-system portion of two tag maps differs.
pub fn user_tags_changed(old: &TagMap, new: &TagMap) -> bool {
    filter_system_tags(old) != filter_system_tags(new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> TagMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn casefold_preserves_values_and_system_keys() {
        let tags = map(&[("Artist", "AC/DC"), ("_updated", "2025-01-01")]);
        let folded = casefold_tags(&tags);
        assert_eq!(folded.get("artist").map(String::as_str), Some("AC/DC"));
        assert_eq!(folded.get("_updated").map(String::as_str), Some("2025-01-01"));
    }

    #[test]
    fn filter_strips_system_keys() {
        let tags = map(&[("topic", "api"), ("_source", "inline")]);
        let user = filter_system_tags(&tags);
        assert_eq!(user.len(), 1);
        assert!(user.contains_key("topic"));
    }

    #[test]
    fn user_tags_changed_ignores_system() {
        let old = map(&[("topic", "api"), ("_updated", "a")]);
        let new = map(&[("topic", "api"), ("_updated", "b")]);
        assert!(!user_tags_changed(&old, &new));
        let new2 = map(&[("topic", "quota"), ("_updated", "b")]);
        assert!(user_tags_changed(&old, &new2));
    }

    #[test]
    fn key_validation() {
        assert!(validate_tag_key("topic").is_ok());
        assert!(validate_tag_key("my-tag_2").is_ok());
        assert!(validate_tag_key("").is_err());
        assert!(validate_tag_key("9lives").is_err());
        let err = validate_tag_key("status:open").unwrap_err();
        assert!(err.to_string().contains("separate key and value"));
    }
}
