//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate store calls and document I/O into reconciliation use-cases.
//! - Keep the CLI and the watcher daemon decoupled from storage details.

pub mod reconcile_service;
