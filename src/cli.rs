//! CLI entry point: argument parsing, configuration bootstrap, command
//! dispatch, and output discipline.
//!
//! Stream discipline: in machine mode (`--json`) the primary output is a
//! single JSON envelope on stdout and the side channel is empty on success.
//! In human mode stdout carries only paths and identifiers; all progress,
//! warnings and errors go to stderr.

pub mod args;
pub(crate) mod commands;

pub use args::{Cli, ColorMode, Commands, ConfigCommands, ReposCommands, build_cli};

use camino::Utf8PathBuf;
use clap::Parser;

use dsr_types::{ErrorEntry, RunEnvelope, RunStatus, envelope::EnvelopeBuilder};
use dsr_utils::{DsrError, ExitCode};

use crate::cli::commands::App;

/// What one command produced: the envelope, plus the bare stdout lines for
/// human mode.
pub struct CommandOutput {
    pub envelope: RunEnvelope,
    pub stdout_lines: Vec<String>,
}

impl CommandOutput {
    /// Wrap a single fatal error in an envelope, with its remedy appended
    /// for the human-mode error line.
    #[must_use]
    pub fn from_error(command: &str, tool: &str, err: &DsrError) -> Self {
        let mut builder = EnvelopeBuilder::begin(command, tool, "");
        let mut entry = ErrorEntry::from_error(err, None);
        if let Some(remedy) = err.remedy() {
            entry.message = format!("{} - {remedy}", entry.message);
        }
        builder.push_error(entry);
        Self {
            envelope: builder.finish(RunStatus::Error, err.to_exit_code()),
            stdout_lines: Vec::new(),
        }
    }
}

/// Main CLI execution. Handles all output; main only maps the returned
/// exit code.
pub fn run() -> Result<(), ExitCode> {
    // Parse errors are invalid-arguments (exit 4), not clap's default 2,
    // which this tool reserves for lock conflicts.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                print!("{e}");
                return Ok(());
            }
            eprint!("{e}");
            return Err(ExitCode::INVALID_CONFIG);
        }
    };

    // Directory overrides must land before any path resolution.
    if let Some(dir) = &cli.state_dir {
        // SAFETY: set before any thread is spawned.
        unsafe { std::env::set_var("DSR_STATE_DIR", dir) };
    }
    if let Some(dir) = &cli.cache_dir {
        unsafe { std::env::set_var("DSR_CACHE_DIR", dir) };
    }

    let _ = dsr_utils::logging::init_tracing(
        cli.verbose,
        cli.quiet,
        cli.log_level.as_deref(),
        cli.color.forced(),
    );

    let config_dir = cli
        .config_dir
        .as_ref()
        .and_then(|p| Utf8PathBuf::from_path_buf(p.clone()).ok())
        .unwrap_or_else(dsr_utils::paths::config_dir);

    let overrides = dsr_config::CliOverrides {
        log_level: cli.log_level.clone(),
        ..dsr_config::CliOverrides::default()
    };
    let config = match dsr_config::load(
        &config_dir,
        &overrides,
        &dsr_config::EnvSource::from_process(),
    ) {
        Ok(config) => config,
        Err(err) => {
            let output = CommandOutput::from_error("config", "", &err);
            return emit(output, cli.json);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create async runtime: {e}");
            return Err(ExitCode::PARTIAL);
        }
    };

    let app = App {
        config,
        config_dir,
        dry_run: cli.dry_run,
        non_interactive: cli.non_interactive,
    };

    let command_name = command_name(&cli.command);
    let output = rt.block_on(async {
        tokio::select! {
            output = app.dispatch(cli.command) => output,
            _ = tokio::signal::ctrl_c() => {
                // Graceful cancel: in-flight workers are dropped with their
                // runtime; report the interruption as its own class.
                CommandOutput::from_error(command_name, "", &DsrError::Cancelled)
            }
        }
    });

    emit(output, cli.json)
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Check { .. } => "check",
        Commands::Watch { .. } => "watch",
        Commands::Build { .. } => "build",
        Commands::Release { .. } => "release",
        Commands::Fallback { .. } => "fallback",
        Commands::Status { .. } => "status",
        Commands::Doctor => "doctor",
        Commands::Prune { .. } => "prune",
        Commands::Repos(_) => "repos",
        Commands::Config(_) => "config",
    }
}

/// Print the result per the stream discipline and map to the exit code.
fn emit(output: CommandOutput, json: bool) -> Result<(), ExitCode> {
    if json {
        match serde_json::to_string_pretty(&output.envelope) {
            Ok(doc) => println!("{doc}"),
            Err(e) => {
                eprintln!("failed to serialize envelope: {e}");
                return Err(ExitCode::PARTIAL);
            }
        }
    } else {
        for line in &output.stdout_lines {
            println!("{line}");
        }
        for warning in &output.envelope.warnings {
            eprintln!("! [{}] {}", warning.code, warning.message);
        }
        for error in &output.envelope.errors {
            eprintln!("x [{}] {}", error.code, error.message);
        }
    }

    if output.envelope.exit_code == 0 {
        Ok(())
    } else {
        Err(ExitCode::from_i32(output.envelope.exit_code))
    }
}
