//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the unit store contract the reconciliation engine composes
//!   against.
//! - Isolate SQLite query details from engine orchestration.
//!
//! # Invariants
//! - Callers check a fingerprint before creating it; blind inserts of a known
//!   fingerprint are contract violations, reported as
//!   `RepoError::DuplicateFingerprint`.
//! - Deleting or touching an absent row is a no-op, not an error.

pub mod unit_repo;
