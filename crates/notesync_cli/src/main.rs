//! `notesync` command-line entry point.
//!
//! # Responsibility
//! - Map subcommands onto workspace and engine operations.
//! - Run the watch daemon until the process is signalled.
//!
//! # Invariants
//! - Every failure prints one `error:` line on stderr and exits with status 1.
//! - The workspace location comes from `NOTESYNC_PATH` or the current
//!   directory.

use clap::{Parser, Subcommand};
use log::warn;
use notesync_core::model::unit::short_fingerprint;
use notesync_core::{
    init_logging, render, ContentUnit, InitOutcome, ReconcileReport, WatchDaemon, Workspace,
};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Parser)]
#[command(
    name = "notesync",
    version = env!("CARGO_PKG_VERSION"),
    about = "Keep a plain-text notes document and its store in sync",
    long_about = "Keeps notes.md and notes.db consistent.\n\
                  The base directory comes from NOTESYNC_PATH (default: current directory);\n\
                  NOTESYNC_LOG sets the log level."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store and an empty notes document
    Init,
    /// Add a note directly to the store
    Add {
        /// Note text; blank lines split it into several notes
        #[arg(allow_hyphen_values = true)]
        text: String,
    },
    /// Search notes; prefix a term with '-' to exclude it
    #[command(override_usage = "notesync grep [--json] <TERM>...")]
    Grep {
        /// Print matches as JSON; must come before the terms
        #[arg(long)]
        json: bool,
        /// Everything from the first term on is a term, `--json` included
        #[arg(
            value_name = "TERM",
            required = true,
            allow_hyphen_values = true,
            trailing_var_arg = true,
            num_args = 1..
        )]
        terms: Vec<String>,
    },
    /// Rewrite the notes document from the store
    Export,
    /// Reconcile the notes document into the store once
    Reconcile,
    /// Register a document for watching
    Watch { path: PathBuf },
    /// Unregister a watched document
    Unwatch { path: PathBuf },
    /// Run the watcher until interrupted
    Watcher,
    /// Print every note, newest first
    List {
        /// Print notes as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print watched documents
    Watches,
    /// Delete every note containing a term
    Purge { term: String },
    /// Print store and checkpoint summary
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> CliResult {
    let workspace = Workspace::from_env()?;
    let config = workspace.config();
    if let Err(err) = init_logging(&config.log_level, &config.log_dir()) {
        eprintln!("warning: logging disabled: {err}");
    }

    match command {
        Commands::Init => match workspace.init()? {
            InitOutcome::Created => {
                println!("Initialized notes in {}", workspace.base_dir().display())
            }
            InitOutcome::AlreadyInitialized => println!(
                "Already initialized: {}",
                workspace.store_path().display()
            ),
        },
        Commands::Add { text } => {
            for outcome in workspace.engine()?.add_unit(&text)? {
                let verb = if outcome.created { "Added" } else { "Moved to top" };
                println!(
                    "{verb} {}",
                    short_fingerprint(&outcome.unit.fingerprint)
                );
            }
        }
        Commands::Grep { json, terms } => {
            let units = workspace.engine()?.search_args(&terms)?;
            print_units(&units, json, "No matches.")?;
        }
        Commands::Export => {
            let engine = workspace.engine()?;
            let report = engine.regenerate()?;
            println!(
                "Wrote {} notes to {}",
                report.units,
                engine.primary_document().display()
            );
        }
        Commands::Reconcile => {
            let report = workspace.engine()?.reconcile()?;
            print_report(&report);
        }
        Commands::Watch { path } => {
            let outcome = workspace.engine()?.watch_document(&path)?;
            if outcome.registered {
                println!("Watching {}", outcome.path.display());
            } else {
                println!("Already watching {}", outcome.path.display());
            }
        }
        Commands::Unwatch { path } => {
            if workspace.engine()?.unwatch_document(&path)? {
                println!("Stopped watching {}", path.display());
            } else {
                println!("Not watched: {}", path.display());
            }
        }
        Commands::Watcher => run_watcher(workspace)?,
        Commands::List { json } => {
            let units = workspace.engine()?.list_units()?;
            print_units(&units, json, "No notes yet.")?;
        }
        Commands::Watches => {
            for watch in workspace.engine()?.list_watches()? {
                println!("{}", watch.path);
            }
        }
        Commands::Purge { term } => {
            let removed = workspace.engine()?.purge(&term)?;
            println!("Removed {removed} notes");
        }
        Commands::Status => {
            let engine = workspace.engine()?;
            println!("document: {}", engine.primary_document().display());
            println!("notes: {}", engine.list_units()?.len());
            println!("unreconciled: {}", engine.unreconciled_units()?.len());
            println!("watched documents: {}", engine.list_watches()?.len());
            println!("checkpoint: {}", engine.checkpoint()?);
        }
    }
    Ok(())
}

fn run_watcher(workspace: Workspace) -> CliResult {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    println!(
        "Watching {} (Ctrl+C to stop)",
        workspace.base_dir().display()
    );
    runtime.block_on(WatchDaemon::new(workspace).run(shutdown_signal()))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("event=signal module=cli status=error signal=ctrl_c error={err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("event=signal module=cli status=error signal=term error={err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_units(units: &[ContentUnit], json: bool, empty_message: &str) -> CliResult {
    if json {
        println!("{}", serde_json::to_string_pretty(units)?);
    } else if units.is_empty() {
        println!("{empty_message}");
    } else {
        println!("{}", render(units));
    }
    Ok(())
}

fn print_report(report: &ReconcileReport) {
    println!(
        "parsed {}, created {}, deleted {}, kept {} new",
        report.parsed, report.created, report.deleted, report.preserved
    );
    if report.render.written {
        println!("document rewritten ({} notes)", report.render.units);
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, Commands};
    use clap::{CommandFactory, Parser};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn grep_accepts_exclude_terms() {
        let cli = Cli::try_parse_from(["notesync", "grep", "--json", "apple", "-pie"]).unwrap();
        match cli.command {
            Commands::Grep { json, terms } => {
                assert!(json);
                assert_eq!(terms, vec!["apple", "-pie"]);
            }
            _ => panic!("expected grep"),
        }
    }

    #[test]
    fn grep_options_stop_at_the_first_term() {
        let cli = Cli::try_parse_from(["notesync", "grep", "apple", "--json"]).unwrap();
        match cli.command {
            Commands::Grep { json, terms } => {
                assert!(!json);
                assert_eq!(terms, vec!["apple", "--json"]);
            }
            _ => panic!("expected grep"),
        }
    }

    #[test]
    fn add_takes_text_starting_with_a_dash() {
        for text in ["- buy milk", "-1 idea"] {
            let cli = Cli::try_parse_from(["notesync", "add", text]).unwrap();
            match cli.command {
                Commands::Add { text: parsed } => assert_eq!(parsed, text),
                _ => panic!("expected add"),
            }
        }
    }

    #[test]
    fn grep_requires_a_term() {
        assert!(Cli::try_parse_from(["notesync", "grep"]).is_err());
    }
}
