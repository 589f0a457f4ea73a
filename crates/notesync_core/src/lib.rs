//! Core domain logic for notesync.
//!
//! Keeps a plain-text notes document and a SQLite unit store consistent,
//! and watches extra documents that project subsets of the store.

pub mod clock;
pub mod codec;
pub mod config;
pub mod db;
pub mod document;
pub mod logging;
pub mod model;
pub mod repo;
pub mod search;
pub mod service;
pub mod watch;
pub mod workspace;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::document::{parse, render};
pub use config::NotesyncConfig;
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::unit::{fingerprint, normalize, CanonicalUnit, ContentUnit, Timestamp, UnitId};
pub use repo::unit_repo::{RepoError, RepoResult, SqliteUnitStore, UnitStore, WatchRegistration};
pub use search::terms::{SearchError, SearchTerms};
pub use service::reconcile_service::{
    AddOutcome, EngineError, EngineResult, ReconcileReport, ReconcileService, RenderReport,
    WatchOutcome,
};
pub use watch::daemon::WatchDaemon;
pub use watch::{WatchError, WatchResult};
pub use workspace::{Engine, InitOutcome, Workspace};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
