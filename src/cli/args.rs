//! CLI argument definitions.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// dsr - fallback release pipeline
#[derive(Parser)]
#[command(name = "dsr")]
#[command(about = "Reproduce a project's hosted CI release on local build hosts when the queue stalls")]
#[command(long_about = r#"
dsr watches a project's hosted CI queue. When a release run has been queued
past a threshold, dsr reproduces the release locally: it dispatches the
project's own CI workflow to a pool of build hosts (containerized Linux,
SSH-reached macOS/Windows), collects and signs the artifacts, and publishes
them to the upstream release page with the exact names and checksums the
hosted CI would have produced.

EXAMPLES:
  # Is the hosted CI keeping up?
  dsr check cass

  # Build and publish a release right now, skipping the throttle gate
  dsr release cass --version v0.1.64

  # Probe, and only build+publish if the hosted queue is stalled
  dsr fallback cass

  # Monitor every configured repo, firing fallbacks as needed
  dsr watch

  # Machine-readable output for scripting
  dsr --json check cass | jq .status

CONFIGURATION:
  Three YAML documents in the config directory (default ~/.config/dsr):
  config.yaml (behavior), hosts.yaml (build hosts), repos.d/ (one tool
  descriptor per file). Precedence: flag > DSR_* env > file > default.

EXIT CODES:
  0 success, 1 partial failure, 2 lock conflict, 3 missing dependency,
  4 invalid config, 5 interrupted/timeout, 6 build failed, 7 release
  failed, 8 network error.
"#)]
#[command(version)]
pub struct Cli {
    /// Emit a single JSON envelope on stdout (machine mode)
    #[arg(long, global = true)]
    pub json: bool,

    /// Never prompt; fail instead
    #[arg(long, global = true)]
    pub non_interactive: bool,

    /// Show what would run without building or publishing
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Verbose progress on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Errors only on stderr
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log level filter (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Configuration directory (overrides DSR_CONFIG_DIR)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// State directory (overrides DSR_STATE_DIR)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Cache directory (overrides DSR_CACHE_DIR)
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Color output on stderr
    #[arg(long, global = true, value_enum, default_value = "auto")]
    pub color: ColorMode,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    #[must_use]
    pub fn forced(self) -> Option<bool> {
        match self {
            Self::Auto => None,
            Self::Always => Some(true),
            Self::Never => Some(false),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe the hosted CI queue for one tool
    ///
    /// Exit code 0 when healthy, 1 when at least one run has been queued
    /// strictly longer than the threshold.
    Check {
        /// Tool id from repos.d/
        tool: String,

        /// Queue-age threshold in seconds (default from config.yaml)
        #[arg(long)]
        threshold: Option<u64>,
    },

    /// Monitor every configured repo and fire fallbacks on throttle
    ///
    /// Single-instance (guarded by a lock); polls with +/-20% jitter and
    /// backs off exponentially on consecutive pipeline failures. The same
    /// hosted-CI run never fires twice.
    Watch {
        /// Base polling interval in seconds
        #[arg(long)]
        interval: Option<u64>,

        /// Queue-age threshold in seconds
        #[arg(long)]
        threshold: Option<u64>,

        /// Restrict to these tools (default: all configured)
        tools: Vec<String>,
    },

    /// Build all requested platforms and post-process artifacts
    ///
    /// Stops after signing; nothing is uploaded.
    Build {
        tool: String,

        /// Version to build (default: latest tag of the local checkout)
        #[arg(long)]
        version: Option<String>,

        /// Build only these platforms (default: all declared)
        #[arg(long)]
        platform: Vec<String>,
    },

    /// Build, sign, and publish to the upstream release page
    Release {
        tool: String,

        /// Version to release (default: latest tag of the local checkout)
        #[arg(long)]
        version: Option<String>,

        /// Build only these platforms (default: all declared)
        #[arg(long)]
        platform: Vec<String>,
    },

    /// check + build + release, gated on the throttle probe
    ///
    /// A healthy hosted CI short-circuits to success without building.
    Fallback {
        tool: String,

        /// Version to release (default: latest tag of the local checkout)
        #[arg(long)]
        version: Option<String>,
    },

    /// Show recent runs from the manifest archive
    Status {
        /// Restrict to one tool
        tool: Option<String>,

        /// Number of runs to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Check external dependencies and host reachability
    Doctor,

    /// Delete staged run trees and manifests past the retention window
    Prune {
        /// Retention in days
        #[arg(long, default_value_t = 14)]
        older_than_days: i64,
    },

    /// Manage tool descriptors in repos.d/
    #[command(subcommand)]
    Repos(ReposCommands),

    /// Inspect and edit configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum ReposCommands {
    /// List configured tools
    List,

    /// Scaffold a descriptor for a new tool
    Add {
        /// Tool id
        tool: String,
        /// Upstream repository, owner/name
        repo: String,
        /// Local source checkout
        #[arg(long)]
        source_path: PathBuf,
    },

    /// Remove a tool descriptor
    Remove { tool: String },

    /// Validate every descriptor against hosts and naming
    Validate,

    /// Show one descriptor
    Info { tool: String },

    /// Not supported in this build
    Discover,

    /// Not supported in this build
    Sync,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print one effective setting
    Get { key: String },

    /// Set one setting in config.yaml
    Set { key: String, value: String },

    /// Write starter config.yaml and hosts.yaml
    Init,

    /// Validate all three configuration documents
    Validate,

    /// Not supported in this build
    Migrate,

    /// Not supported in this build
    Edit,
}

/// Build the clap command for introspection in tests.
#[must_use]
pub fn build_cli() -> clap::Command {
    <Cli as clap::CommandFactory>::command()
}
