//! Plain-text document codec.
//!
//! # Responsibility
//! - Split a document into canonical content units.
//! - Serialize units back into the canonical document layout.
//!
//! # See also
//! - `model::unit` for normalization and fingerprint rules.

pub mod document;
