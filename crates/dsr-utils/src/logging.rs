//! Tracing bootstrap.
//!
//! All human-facing progress goes through `tracing` to stderr; stdout is
//! reserved for the run envelope (machine mode) or bare paths and
//! identifiers (human mode).

use std::io::IsTerminal;
use tracing_subscriber::{
    EnvFilter,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Whether colored output should be used on stderr.
///
/// True only when stderr is a terminal, `NO_COLOR` is unset, and the caller
/// did not force it off.
#[must_use]
pub fn use_color(color_flag: Option<bool>) -> bool {
    match color_flag {
        Some(forced) => forced,
        None => std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none(),
    }
}

/// Initialize the tracing subscriber.
///
/// `level` comes from `--log-level` when given, otherwise verbose/quiet pick
/// the default. `RUST_LOG` wins over everything, matching the usual
/// ecosystem behavior.
pub fn init_tracing(
    verbose: bool,
    quiet: bool,
    level: Option<&str>,
    color: Option<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let default_directive = match (level, verbose, quiet) {
        (Some(l), _, _) => format!("dsr={l}"),
        (None, true, _) => "dsr=debug,info".to_string(),
        (None, _, true) => "dsr=error".to_string(),
        (None, false, false) => "dsr=info,warn".to_string(),
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .with_ansi(use_color(color))
                .compact(),
        )
        .try_init()?;

    Ok(())
}
