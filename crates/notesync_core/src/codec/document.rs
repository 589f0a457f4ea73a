//! Block parsing and rendering for notes documents.
//!
//! # Responsibility
//! - Parse raw document text into canonical units in document order.
//! - Render units as blocks separated by exactly one blank line.
//!
//! # Invariants
//! - Parsing never yields an empty unit or two units with one fingerprint.
//! - `render(parse(render(parse(x)))) == render(parse(x))` for any `x`.
//! - Rendering an empty unit list yields an empty document.

use crate::model::unit::{CanonicalUnit, ContentUnit};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// A newline followed by one or more whitespace-only lines.
static BLANK_LINE_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n(?:[^\S\n]*\n)+").expect("valid blank line regex"));

const BLOCK_SEPARATOR: &str = "\n\n";

/// Anything that can be written out as one document block.
pub trait Block {
    fn block_text(&self) -> &str;
}

impl Block for CanonicalUnit {
    fn block_text(&self) -> &str {
        self.content()
    }
}

impl Block for ContentUnit {
    fn block_text(&self) -> &str {
        &self.content
    }
}

/// Parses document text into canonical units.
///
/// Blocks repeated within the same document collapse into their first
/// occurrence, since they share one identity.
pub fn parse(document: &str) -> Vec<CanonicalUnit> {
    let unified = document.replace("\r\n", "\n");
    let mut seen = HashSet::new();

    BLANK_LINE_RUN_RE
        .split(&unified)
        .filter_map(CanonicalUnit::new)
        .filter(|unit| seen.insert(unit.fingerprint().to_string()))
        .collect()
}

/// Renders blocks in the given order, separated by one blank line.
///
/// Callers pass units already sorted by recency.
pub fn render<B: Block>(units: &[B]) -> String {
    units
        .iter()
        .map(Block::block_text)
        .collect::<Vec<_>>()
        .join(BLOCK_SEPARATOR)
}
