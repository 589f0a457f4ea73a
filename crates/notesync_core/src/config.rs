//! Workspace configuration.
//!
//! # Responsibility
//! - Describe where the primary document and store live.
//! - Carry daemon timing knobs (debounce, settle window, sync interval).
//! - Resolve defaults from the process environment.

use crate::logging::default_log_level;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the base directory holding the document and store.
pub const BASE_DIR_ENV: &str = "NOTESYNC_PATH";
/// Overrides the log level.
pub const LOG_LEVEL_ENV: &str = "NOTESYNC_LOG";

pub const DEFAULT_DOCUMENT_FILE: &str = "notes.md";
pub const DEFAULT_STORE_FILE: &str = "notes.db";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for one notes workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotesyncConfig {
    /// Directory holding the primary document and the store.
    pub base_dir: PathBuf,

    /// Primary document file name, relative to `base_dir`.
    pub document_file: String,

    /// Store file name, relative to `base_dir`.
    pub store_file: String,

    /// Quiet period after the last change event before reconciling.
    pub debounce: Duration,

    /// How long events are swallowed after the engine rewrote a document.
    pub settle_window: Duration,

    /// Period of the watch registration sync.
    pub sync_interval: Duration,

    /// Whether the daemon also reconciles the primary document.
    pub track_primary: bool,

    /// Log level (`trace|debug|info|warn|error`).
    pub log_level: String,
}

impl NotesyncConfig {
    /// Creates a config rooted at `base_dir` with default settings.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            document_file: DEFAULT_DOCUMENT_FILE.to_string(),
            store_file: DEFAULT_STORE_FILE.to_string(),
            debounce: DEFAULT_DEBOUNCE,
            settle_window: DEFAULT_DEBOUNCE,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            track_primary: true,
            log_level: default_log_level().to_string(),
        }
    }

    /// Builds the config from `NOTESYNC_PATH` and `NOTESYNC_LOG`.
    ///
    /// Falls back to the current directory and the build-mode log level.
    pub fn from_env() -> io::Result<Self> {
        let base_dir = match std::env::var_os(BASE_DIR_ENV) {
            Some(value) if !value.is_empty() => PathBuf::from(value),
            _ => std::env::current_dir()?,
        };
        let mut config = Self::new(base_dir);
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            if !level.trim().is_empty() {
                config.log_level = level;
            }
        }
        Ok(config)
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_settle_window(mut self, window: Duration) -> Self {
        self.settle_window = window;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Leaves the primary document out of the daemon.
    pub fn without_primary(mut self) -> Self {
        self.track_primary = false;
        self
    }

    pub fn document_path(&self) -> PathBuf {
        self.base_dir.join(&self.document_file)
    }

    pub fn store_path(&self) -> PathBuf {
        self.base_dir.join(&self.store_file)
    }

    /// Directory for rolling log files.
    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join(".notesync").join("logs")
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
