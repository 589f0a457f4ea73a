//! Workspace context.
//!
//! # Responsibility
//! - Own the resolved configuration of one notes workspace.
//! - Hand out store connections and engines to each caller.
//! - Bootstrap a fresh workspace.
//!
//! # Invariants
//! - Every caller gets its own SQLite connection; nothing is shared through
//!   process globals.
//! - Only `init` creates a store; everything else requires one.

use crate::clock::{Clock, SystemClock};
use crate::config::NotesyncConfig;
use crate::db::open_db;
use crate::document::write_if_changed;
use crate::repo::unit_repo::{RepoError, SqliteUnitStore};
use crate::service::reconcile_service::{EngineError, EngineResult, ReconcileService};
use log::info;
use std::io;
use std::path::{Path, PathBuf};

/// Engine over the SQLite store and the wall clock.
pub type Engine = ReconcileService<SqliteUnitStore, SystemClock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Created,
    AlreadyInitialized,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    config: NotesyncConfig,
}

impl Workspace {
    pub fn new(config: NotesyncConfig) -> Self {
        Self { config }
    }

    /// Workspace described by `NOTESYNC_PATH` and `NOTESYNC_LOG`.
    pub fn from_env() -> io::Result<Self> {
        NotesyncConfig::from_env().map(Self::new)
    }

    pub fn config(&self) -> &NotesyncConfig {
        &self.config
    }

    pub fn base_dir(&self) -> &Path {
        self.config.base_dir()
    }

    pub fn document_path(&self) -> PathBuf {
        self.config.document_path()
    }

    pub fn store_path(&self) -> PathBuf {
        self.config.store_path()
    }

    pub fn is_initialized(&self) -> bool {
        self.store_path().is_file()
    }

    /// Creates the base directory, store, empty primary document and
    /// initial checkpoint. A no-op when a store already exists.
    pub fn init(&self) -> EngineResult<InitOutcome> {
        self.init_with_clock(SystemClock)
    }

    pub fn init_with_clock<C: Clock>(&self, clock: C) -> EngineResult<InitOutcome> {
        if self.is_initialized() {
            info!(
                "event=workspace_init module=workspace status=skip base_dir={}",
                self.base_dir().display()
            );
            return Ok(InitOutcome::AlreadyInitialized);
        }

        std::fs::create_dir_all(self.base_dir()).map_err(|source| EngineError::Io {
            path: self.base_dir().to_path_buf(),
            source,
        })?;
        let store = SqliteUnitStore::new(open_db(self.store_path()).map_err(RepoError::from)?);

        let document = self.document_path();
        if !document.exists() {
            write_if_changed(&document, "").map_err(|source| EngineError::Io {
                path: document.clone(),
                source,
            })?;
        }

        let checkpoint = ReconcileService::new(store, clock, document).ensure_checkpoint()?;
        info!(
            "event=workspace_init module=workspace status=ok base_dir={} checkpoint={checkpoint}",
            self.base_dir().display()
        );
        Ok(InitOutcome::Created)
    }

    /// Opens a new connection to the existing store.
    pub fn open_store(&self) -> EngineResult<SqliteUnitStore> {
        if !self.is_initialized() {
            return Err(EngineError::NotInitialized(self.base_dir().to_path_buf()));
        }
        let conn = open_db(self.store_path()).map_err(RepoError::from)?;
        Ok(SqliteUnitStore::new(conn))
    }

    /// Engine on its own connection, timed by the wall clock.
    pub fn engine(&self) -> EngineResult<Engine> {
        self.engine_with_clock(SystemClock)
    }

    pub fn engine_with_clock<C: Clock>(
        &self,
        clock: C,
    ) -> EngineResult<ReconcileService<SqliteUnitStore, C>> {
        Ok(ReconcileService::new(
            self.open_store()?,
            clock,
            self.document_path(),
        ))
    }
}
