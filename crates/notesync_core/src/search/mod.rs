//! Keyword search entry points.
//!
//! # Responsibility
//! - Parse include/exclude term lists from command-style arguments.
//! - Decide whether a unit's content matches a term query.
//!
//! # See also
//! - `repo::unit_repo::UnitStore::search`

pub mod terms;
