#![forbid(unsafe_code)]

//! `session-runtime-ctl`: maintenance CLI for a checkpoint file.
//!
//! Operates directly on the store file; do not run against a file that a
//! live gateway is writing.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use session_runtime::persistence::CheckpointStore;
use session_runtime::{AppError, GlobalConfig, Result};
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "session-runtime-ctl",
    about = "Inspect and reset sessions in a checkpoint file",
    version,
    long_about = None
)]
struct Cli {
    /// Checkpoint file to operate on.
    #[arg(long, conflicts_with = "config")]
    store: Option<PathBuf>,

    /// TOML configuration whose `store_path` names the checkpoint file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List stored sessions.
    List,

    /// Print one session's checkpoint as JSON.
    Show {
        /// Session key.
        session_id: String,
    },

    /// Delete one session's checkpoint.
    Reset {
        /// Session key.
        session_id: String,
    },
}

impl Cli {
    fn store_path(&self) -> Result<PathBuf> {
        match (&self.store, &self.config) {
            (Some(store), _) => Ok(store.clone()),
            (None, Some(config)) => Ok(GlobalConfig::load_from_path(config)?.store_path),
            (None, None) => Err(AppError::Config(
                "either --store or --config is required".into(),
            )),
        }
    }
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Cli) -> Result<()> {
    let store = CheckpointStore::open(args.store_path()?);

    match &args.command {
        Command::List => {
            for session_id in store.session_ids() {
                let Some(checkpoint) = store.get(&session_id) else {
                    continue;
                };
                println!(
                    "{session_id}\tturns={}\tactions={}\tsummarized={}\tupdated={}",
                    checkpoint.turns.len(),
                    checkpoint.action_count,
                    checkpoint.is_summarized(),
                    checkpoint.updated_at.to_rfc3339(),
                );
            }
        }
        Command::Show { session_id } => {
            let checkpoint = store
                .get(session_id)
                .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }
        Command::Reset { session_id } => {
            if store.delete(session_id) {
                println!("reset {session_id}");
            } else {
                return Err(AppError::NotFound(format!("session {session_id}")));
            }
        }
    }
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
