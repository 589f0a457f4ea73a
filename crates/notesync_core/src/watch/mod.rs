//! Change notifier.
//!
//! # Responsibility
//! - Turn filesystem events on watched documents into reconciliation passes.
//! - Keep watched-path actors in step with persisted registrations.
//!
//! # Invariants
//! - Each watched path is owned by exactly one actor; passes for a path run
//!   serially inside it.
//! - An actor ignores the events caused by its own document rewrite.
//! - Only startup failures stop the daemon; later errors are logged.

use crate::service::reconcile_service::EngineError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod actor;
pub mod daemon;
pub mod event;

pub type WatchResult<T> = Result<T, WatchError>;

#[derive(Debug)]
pub enum WatchError {
    Notify(notify::Error),
    Engine(EngineError),
    Join(tokio::task::JoinError),
}

impl Display for WatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Notify(err) => write!(f, "filesystem watch failed: {err}"),
            Self::Engine(err) => write!(f, "{err}"),
            Self::Join(err) => write!(f, "watch task failed: {err}"),
        }
    }
}

impl Error for WatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Notify(err) => Some(err),
            Self::Engine(err) => Some(err),
            Self::Join(err) => Some(err),
        }
    }
}

impl From<notify::Error> for WatchError {
    fn from(value: notify::Error) -> Self {
        Self::Notify(value)
    }
}

impl From<EngineError> for WatchError {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}

impl From<tokio::task::JoinError> for WatchError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Join(value)
    }
}
