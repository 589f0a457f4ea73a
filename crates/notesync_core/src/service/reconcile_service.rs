//! Reconciliation engine.
//!
//! # Responsibility
//! - Merge parsed document units into the store by fingerprint.
//! - Render documents back from the store as recency-ordered projections.
//! - Serve direct adds, searches and watch registration changes.
//!
//! # Invariants
//! - Single-document passes (`reconcile`) never promote units already
//!   stored; units absent from the document are deleted unless created after
//!   the checkpoint.
//! - Multi-document passes (`reconcile_document`) promote every unit present
//!   in the document and delete, store-wide, every unit that left it.
//! - Store changes of one pass commit together; the document is written only
//!   after the commit.
//! - The checkpoint never moves backwards. A primary pass moves it in the
//!   same transaction that merges the document and snapshots the units it
//!   renders.
//! - Units created or promoted outside a primary pass are stamped after the
//!   checkpoint, so the next primary pass protects them.

use crate::clock::{Clock, LOGICAL_TICK_MS};
use crate::codec::document::{parse, render};
use crate::document::{
    backup_document, read_document, read_existing_document, resolve_path, write_if_changed,
};
use crate::model::unit::{fingerprint, short_fingerprint, CanonicalUnit, ContentUnit, Timestamp};
use crate::repo::unit_repo::{RepoError, UnitStore, WatchRegistration};
use crate::search::terms::SearchTerms;
use log::{debug, info};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Metadata key holding the checkpoint, in epoch milliseconds.
pub const CHECKPOINT_KEY: &str = "last_reconciliation_time";

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error for reconciliation, add, search and watch use-cases.
#[derive(Debug)]
pub enum EngineError {
    /// Content normalized to nothing.
    EmptyContent,
    /// The document is not registered for watching.
    NotWatched(PathBuf),
    /// The path cannot be used as a document.
    InvalidPath { path: PathBuf, reason: String },
    /// No store exists at the workspace location.
    NotInitialized(PathBuf),
    /// The persisted checkpoint is not a timestamp.
    InvalidCheckpoint(String),
    /// Document read or write failure.
    Io { path: PathBuf, source: io::Error },
    Repo(RepoError),
}

impl EngineError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the error stems from caller input rather than I/O or storage.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyContent
                | Self::NotWatched(_)
                | Self::InvalidPath { .. }
                | Self::NotInitialized(_)
                | Self::Repo(RepoError::InvalidQuery(_))
        )
    }

    /// Whether the store stayed locked by another writer; retrying may work.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Repo(err) if err.is_busy())
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyContent => write!(f, "content cannot be empty"),
            Self::NotWatched(path) => write!(f, "document is not watched: {}", path.display()),
            Self::InvalidPath { path, reason } => {
                write!(f, "invalid document path {}: {reason}", path.display())
            }
            Self::NotInitialized(path) => write!(
                f,
                "no notes store found at {}; run `notesync init` first",
                path.display()
            ),
            Self::InvalidCheckpoint(value) => write!(f, "invalid checkpoint value `{value}`"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for EngineError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Result of writing one document projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderReport {
    /// Units rendered into the document.
    pub units: usize,
    /// Whether the file bytes changed.
    pub written: bool,
    /// Fingerprint of the rendered text, used to recognize our own writes.
    pub document_fingerprint: String,
}

/// Counters of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub parsed: usize,
    pub created: usize,
    pub promoted: usize,
    pub deleted: usize,
    /// Store-only units kept because they were created after the checkpoint.
    pub preserved: usize,
    pub render: RenderReport,
}

/// Outcome of adding one block directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    pub unit: ContentUnit,
    /// `false` when an existing unit was promoted instead.
    pub created: bool,
}

/// Outcome of a watch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOutcome {
    pub path: PathBuf,
    /// `false` when the path was already registered.
    pub registered: bool,
}

/// Store/document merge engine over a unit store and a clock.
pub struct ReconcileService<S: UnitStore, C: Clock> {
    store: S,
    clock: C,
    primary_document: PathBuf,
}

impl<S: UnitStore, C: Clock> ReconcileService<S, C> {
    /// Creates an engine whose primary view is `primary_document`.
    pub fn new(store: S, clock: C, primary_document: impl Into<PathBuf>) -> Self {
        Self {
            store,
            clock,
            primary_document: primary_document.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn primary_document(&self) -> &Path {
        &self.primary_document
    }

    /// Current checkpoint; `0` before the first pass.
    pub fn checkpoint(&self) -> EngineResult<Timestamp> {
        read_checkpoint(&self.store)
    }

    /// Stores `now` as the checkpoint unless one exists; returns the result.
    pub fn ensure_checkpoint(&self) -> EngineResult<Timestamp> {
        self.store.atomically(|store| -> EngineResult<Timestamp> {
            if store.get_metadata(CHECKPOINT_KEY)?.is_some() {
                return read_checkpoint(store);
            }
            let now = self.clock.now_ms();
            store.set_metadata(CHECKPOINT_KEY, &now.to_string())?;
            Ok(now)
        })
    }

    /// Single-document pass over the primary document.
    ///
    /// Creates unknown units, deletes units the user removed, keeps units
    /// added directly since the last pass, rewrites the document and moves
    /// the checkpoint past `now`.
    pub fn reconcile(&self) -> EngineResult<ReconcileReport> {
        let started_at = Instant::now();
        let path = self.primary_document.as_path();
        let text = read_document(path).map_err(|err| EngineError::io(path, err))?;
        let parsed = parse(&text);
        let mut report = ReconcileReport {
            parsed: parsed.len(),
            ..ReconcileReport::default()
        };

        // A unit another connection commits is either in this snapshot or
        // stamped after the checkpoint set here.
        let units = self.store.atomically(|store| -> EngineResult<Vec<ContentUnit>> {
            let now = self.clock.now_ms();
            let checkpoint = read_checkpoint(store)?;
            // Bottom-up, so new blocks keep their reading order on equal timestamps.
            for unit in parsed.iter().rev() {
                if store.find_by_fingerprint(unit.fingerprint())?.is_none() {
                    store.insert_new(unit, now)?;
                    report.created += 1;
                    debug!(
                        "event=unit_create module=engine fingerprint={}",
                        short_fingerprint(unit.fingerprint())
                    );
                }
            }

            let present: HashSet<&str> = parsed.iter().map(CanonicalUnit::fingerprint).collect();
            for unit in store.list_all()? {
                if present.contains(unit.fingerprint.as_str()) {
                    continue;
                }
                if unit.created_after(checkpoint) {
                    report.preserved += 1;
                    debug!(
                        "event=unit_preserve module=engine id={} fingerprint={}",
                        unit.id,
                        short_fingerprint(&unit.fingerprint)
                    );
                    continue;
                }
                store.delete_by_id(unit.id)?;
                report.deleted += 1;
                debug!(
                    "event=unit_delete module=engine id={} fingerprint={}",
                    unit.id,
                    short_fingerprint(&unit.fingerprint)
                );
            }

            let next = checkpoint.max(now + LOGICAL_TICK_MS);
            store.set_metadata(CHECKPOINT_KEY, &next.to_string())?;
            Ok(store.list_all()?)
        })?;

        report.render = self.write_primary(&units)?;

        info!(
            "event=reconcile module=engine status=ok mode=checkpoint parsed={} created={} deleted={} preserved={} units={} written={} duration_ms={}",
            report.parsed,
            report.created,
            report.deleted,
            report.preserved,
            report.render.units,
            report.render.written,
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }

    /// Multi-document pass over one watched document.
    ///
    /// Every unit found in the document is promoted and recorded as a member.
    /// Units that were members before and are gone now are deleted from the
    /// whole store, so every other document sharing that content loses it
    /// as well on its next render.
    pub fn reconcile_document(&self, path: &Path) -> EngineResult<ReconcileReport> {
        let started_at = Instant::now();
        let key = path_key(path)?;
        if !self.store.is_watched(&key)? {
            return Err(EngineError::NotWatched(path.to_path_buf()));
        }

        let text = read_existing_document(path).map_err(|err| EngineError::io(path, err))?;
        let parsed = parse(&text);
        let mut report = ReconcileReport {
            parsed: parsed.len(),
            ..ReconcileReport::default()
        };

        self.store.atomically(|store| -> EngineResult<()> {
            let now = self.stamp(store)?;
            let before = store.memberships_of(&key)?;
            for unit in parsed.iter().rev() {
                if store.find_by_fingerprint(unit.fingerprint())?.is_none() {
                    store.insert_new(unit, now)?;
                    report.created += 1;
                } else {
                    store.touch(unit.fingerprint(), now)?;
                    report.promoted += 1;
                }
                store.add_membership(&key, unit.fingerprint())?;
            }

            let after: HashSet<&str> = parsed.iter().map(CanonicalUnit::fingerprint).collect();
            for gone in before.iter().filter(|fp| !after.contains(fp.as_str())) {
                if store.delete_by_fingerprint(gone)? {
                    report.deleted += 1;
                    debug!(
                        "event=unit_delete module=engine path={} fingerprint={}",
                        key,
                        short_fingerprint(gone)
                    );
                }
            }
            Ok(())
        })?;

        report.render = self.render_watched(path, &key)?;

        info!(
            "event=reconcile module=engine status=ok mode=membership path={} parsed={} created={} promoted={} deleted={} units={} written={} duration_ms={}",
            key,
            report.parsed,
            report.created,
            report.promoted,
            report.deleted,
            report.render.units,
            report.render.written,
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }

    /// Adds content directly, bypassing the document.
    ///
    /// Each block of `content` becomes one unit; a block already stored is
    /// promoted instead. The primary document is regenerated afterwards.
    pub fn add_unit(&self, content: &str) -> EngineResult<Vec<AddOutcome>> {
        let blocks = parse(content);
        if blocks.is_empty() {
            return Err(EngineError::EmptyContent);
        }
        let outcomes = self
            .store
            .atomically(|store| -> EngineResult<Vec<AddOutcome>> {
                let now = self.stamp(store)?;
                let mut outcomes = Vec::with_capacity(blocks.len());
                // Reverse insertion gives the first block the highest id, so it
                // renders on top among equal timestamps.
                for block in blocks.iter().rev() {
                    let outcome = match store.find_by_fingerprint(block.fingerprint())? {
                        Some(mut existing) => {
                            store.touch(block.fingerprint(), now)?;
                            existing.updated_at = now;
                            AddOutcome {
                                unit: existing,
                                created: false,
                            }
                        }
                        None => AddOutcome {
                            unit: store.insert_new(block, now)?,
                            created: true,
                        },
                    };
                    outcomes.push(outcome);
                }
                outcomes.reverse();
                Ok(outcomes)
            })?;

        for outcome in &outcomes {
            info!(
                "event=unit_add module=engine status=ok created={} fingerprint={}",
                outcome.created,
                short_fingerprint(&outcome.unit.fingerprint)
            );
        }

        self.render_primary()?;
        Ok(outcomes)
    }

    /// Units matching the include/exclude terms, newest first.
    pub fn search(&self, include: &[String], exclude: &[String]) -> EngineResult<Vec<ContentUnit>> {
        Ok(self.store.search(include, exclude)?)
    }

    /// Searches with a command-style argument vector (`-term` excludes).
    pub fn search_args<I, T>(&self, args: I) -> EngineResult<Vec<ContentUnit>>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let terms = SearchTerms::from_args(args);
        self.search(&terms.include, &terms.exclude)
    }

    /// All units, newest first.
    pub fn list_units(&self) -> EngineResult<Vec<ContentUnit>> {
        Ok(self.store.list_all()?)
    }

    /// Units created after the checkpoint, i.e. not yet seen by a pass.
    pub fn unreconciled_units(&self) -> EngineResult<Vec<ContentUnit>> {
        let checkpoint = self.checkpoint()?;
        Ok(self.store.list_created_after(checkpoint)?)
    }

    /// Deletes every unit containing `term` and regenerates the primary view.
    pub fn purge(&self, term: &str) -> EngineResult<usize> {
        let removed = self.store.delete_matching(term)?;
        info!("event=purge module=engine status=ok removed={removed}");
        self.render_primary()?;
        Ok(removed)
    }

    /// Rewrites the primary document from the whole store.
    pub fn regenerate(&self) -> EngineResult<RenderReport> {
        self.render_primary()
    }

    /// Rewrites one watched document from its memberships.
    pub fn regenerate_document(&self, path: &Path) -> EngineResult<RenderReport> {
        let key = path_key(path)?;
        if !self.store.is_watched(&key)? {
            return Err(EngineError::NotWatched(path.to_path_buf()));
        }
        self.render_watched(path, &key)
    }

    /// Registers `path` for watching. Does not reconcile it.
    pub fn watch_document(&self, path: &Path) -> EngineResult<WatchOutcome> {
        let resolved = resolve_path(path).map_err(|err| EngineError::io(path, err))?;
        if !resolved.is_file() {
            return Err(EngineError::InvalidPath {
                path: resolved,
                reason: "file does not exist".to_string(),
            });
        }
        if self.is_primary(&resolved) {
            return Err(EngineError::InvalidPath {
                path: resolved,
                reason: "the primary document is reconciled on its own".to_string(),
            });
        }

        let key = path_key(&resolved)?;
        let registered = self.store.register_watch(&key, self.clock.now_ms())?;
        info!("event=watch_register module=engine status=ok path={key} registered={registered}");
        Ok(WatchOutcome {
            path: resolved,
            registered,
        })
    }

    /// Removes the registration of `path` and its memberships.
    ///
    /// Returns `false` when the path was not registered.
    pub fn unwatch_document(&self, path: &Path) -> EngineResult<bool> {
        let resolved = resolve_path(path).map_err(|err| EngineError::io(path, err))?;
        let key = path_key(&resolved)?;
        let removed = self.store.unregister_watch(&key)?;
        info!("event=watch_unregister module=engine status=ok path={key} removed={removed}");
        Ok(removed)
    }

    pub fn list_watches(&self) -> EngineResult<Vec<WatchRegistration>> {
        Ok(self.store.list_watches()?)
    }

    fn is_primary(&self, resolved: &Path) -> bool {
        resolve_path(&self.primary_document).is_ok_and(|primary| primary == resolved)
    }

    /// Write time for passes other than the primary one.
    ///
    /// Never at or below the checkpoint: a unit stamped in the same tick as
    /// a primary pass that did not render it must still be protected by the
    /// next one.
    fn stamp(&self, store: &S) -> EngineResult<Timestamp> {
        let checkpoint = read_checkpoint(store)?;
        Ok(self.clock.now_ms().max(checkpoint + LOGICAL_TICK_MS))
    }

    fn render_primary(&self) -> EngineResult<RenderReport> {
        let units = self.store.list_all()?;
        self.write_primary(&units)
    }

    fn write_primary(&self, units: &[ContentUnit]) -> EngineResult<RenderReport> {
        let path = self.primary_document.as_path();
        let rendered = render(units);

        let current = read_document(path).map_err(|err| EngineError::io(path, err))?;
        if current != rendered {
            backup_document(path).map_err(|err| EngineError::io(path, err))?;
        }
        write_rendered(path, &rendered, units.len())
    }

    fn render_watched(&self, path: &Path, key: &str) -> EngineResult<RenderReport> {
        let units = self.store.list_document_units(key)?;
        write_rendered(path, &render(&units), units.len())
    }

}

fn write_rendered(path: &Path, rendered: &str, units: usize) -> EngineResult<RenderReport> {
    let written = write_if_changed(path, rendered).map_err(|err| EngineError::io(path, err))?;
    if written {
        debug!(
            "event=document_write module=engine path={} units={units}",
            path.display()
        );
    }
    Ok(RenderReport {
        units,
        written,
        document_fingerprint: fingerprint(rendered),
    })
}

fn read_checkpoint<S: UnitStore>(store: &S) -> EngineResult<Timestamp> {
    match store.get_metadata(CHECKPOINT_KEY)? {
        None => Ok(0),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| EngineError::InvalidCheckpoint(value)),
    }
}

/// Store key for a document path.
pub fn path_key(path: &Path) -> EngineResult<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| EngineError::InvalidPath {
            path: path.to_path_buf(),
            reason: "path is not valid UTF-8".to_string(),
        })
}
