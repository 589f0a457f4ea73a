//! Content unit domain model.
//!
//! # Responsibility
//! - Define the canonical form of a block of text and its fingerprint.
//! - Define the persisted unit record shared by store, engine and CLI.
//!
//! # Invariants
//! - `fingerprint` is a pure function of canonical content.
//! - Canonical content is never empty; empty input never becomes a unit.
//! - `updated_at` is the only mutable timestamp of a persisted unit.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Store-assigned surrogate key.
pub type UnitId = i64;

/// Logical timestamp in Unix epoch milliseconds.
pub type Timestamp = i64;

/// Normalizes raw block text into canonical form.
///
/// Trailing whitespace is trimmed from every line, then the whole block is
/// trimmed. Whitespace-only input collapses to an empty string.
pub fn normalize(raw: &str) -> String {
    let joined = raw
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    joined.trim().to_string()
}

/// Returns the SHA-256 hex digest of `canonical`.
///
/// Callers are expected to pass already-normalized text; the digest itself is
/// byte-sensitive and does no normalization.
pub fn fingerprint(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{digest:x}")
}

/// Short fingerprint prefix used in log lines.
pub fn short_fingerprint(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

/// Canonical, non-empty block content paired with its fingerprint.
///
/// Only constructible through [`CanonicalUnit::new`], so an empty unit can
/// never exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalUnit {
    content: String,
    fingerprint: String,
}

impl CanonicalUnit {
    /// Normalizes `raw` and fingerprints it. Returns `None` for empty input.
    pub fn new(raw: &str) -> Option<Self> {
        let content = normalize(raw);
        if content.is_empty() {
            return None;
        }
        let fingerprint = fingerprint(&content);
        Some(Self {
            content,
            fingerprint,
        })
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Persisted content unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub id: UnitId,
    /// Canonical text. Never changes for a given row.
    pub content: String,
    /// Identity key, unique across the whole store.
    pub fingerprint: String,
    pub created_at: Timestamp,
    /// Recency key for every rendered view.
    pub updated_at: Timestamp,
}

impl ContentUnit {
    /// Whether this unit was created strictly after `checkpoint`.
    ///
    /// Such units were added outside the document since the last pass and
    /// must survive their absence from it.
    pub fn created_after(&self, checkpoint: Timestamp) -> bool {
        self.created_at > checkpoint
    }
}

#[cfg(test)]
mod tests {
    use super::{fingerprint, normalize, short_fingerprint, CanonicalUnit, ContentUnit};

    #[test]
    fn normalize_trims_lines_and_block() {
        assert_eq!(normalize("  \n  first  \nsecond\t\n\n"), "first\nsecond");
    }

    #[test]
    fn normalize_keeps_leading_indent_of_inner_lines() {
        assert_eq!(normalize("- item\n  - nested  "), "- item\n  - nested");
    }

    #[test]
    fn whitespace_only_input_is_not_a_unit() {
        assert_eq!(normalize(" \t\n  \n"), "");
        assert!(CanonicalUnit::new(" \n\t ").is_none());
    }

    #[test]
    fn fingerprint_is_fixed_length_lowercase_hex() {
        let value = fingerprint("hello");
        assert_eq!(value.len(), 64);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(
            value,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn fingerprint_is_case_sensitive() {
        assert_ne!(fingerprint("Hello"), fingerprint("hello"));
    }

    #[test]
    fn canonical_unit_fingerprints_normalized_content() {
        let unit = CanonicalUnit::new("  note  \n").unwrap();
        assert_eq!(unit.content(), "note");
        assert_eq!(unit.fingerprint(), fingerprint("note"));
    }

    #[test]
    fn short_fingerprint_handles_short_input() {
        assert_eq!(short_fingerprint("abc"), "abc");
        assert_eq!(short_fingerprint(&fingerprint("x")).len(), 12);
    }

    #[test]
    fn content_unit_json_uses_field_names() {
        let unit = ContentUnit {
            id: 7,
            content: "note".to_string(),
            fingerprint: fingerprint("note"),
            created_at: 1,
            updated_at: 2,
        };
        let value = serde_json::to_value(&unit).unwrap();
        assert_eq!(value["content"], "note");
        assert_eq!(value["updated_at"], 2);
        assert!(unit.created_after(0));
        assert!(!unit.created_after(1));
    }
}
