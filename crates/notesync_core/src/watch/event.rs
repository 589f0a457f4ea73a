//! Filesystem events routed to path actors.

use notify::event::{ModifyKind, RenameMode};
use notify::EventKind;
use std::path::PathBuf;

/// What a raw event means for one watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Content may have changed (write, create, rename onto the path).
    Changed,
    /// The path may be gone (delete, rename away from the path).
    Removed,
    /// Access or metadata noise.
    Ignored,
}

impl From<EventKind> for ChangeKind {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Create(_) => Self::Changed,
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Self::Removed,
            EventKind::Modify(ModifyKind::Metadata(_)) => Self::Ignored,
            EventKind::Modify(_) => Self::Changed,
            EventKind::Remove(_) => Self::Removed,
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Self::Ignored,
        }
    }
}

/// One classified event for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl PathEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Splits a notify event into per-path events, dropping ignored ones.
    ///
    /// A two-path rename reports the source as removed and the target as
    /// changed.
    pub fn from_notify(event: notify::Event) -> Vec<Self> {
        if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
            let mut paths = event.paths.into_iter();
            return match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => vec![
                    Self::new(from, ChangeKind::Removed),
                    Self::new(to, ChangeKind::Changed),
                ],
                (Some(only), None) => vec![Self::new(only, ChangeKind::Changed)],
                _ => Vec::new(),
            };
        }

        let kind = ChangeKind::from(event.kind);
        if kind == ChangeKind::Ignored {
            return Vec::new();
        }
        event
            .paths
            .into_iter()
            .map(|path| Self::new(path, kind))
            .collect()
    }
}
