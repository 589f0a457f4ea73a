//! Domain model for content units.
//!
//! # Responsibility
//! - Define the canonical unit shape shared by codec, store and engine.
//!
//! # Invariants
//! - A unit is identified by the fingerprint of its normalized content.
//! - Unit content is never empty and never carries surrounding whitespace.

pub mod unit;
