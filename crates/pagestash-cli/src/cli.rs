//! # CLI Structure and Argument Parsing
//!
//! Command-line interface for `pagestash`, built with `clap` derive macros.
//!
//! ```bash
//! # Capture a page into the stash directory
//! pagestash capture https://example.com/article
//!
//! # Capture into a specific directory with a lighter browser profile
//! pagestash capture https://example.com/ --out ./archives --mode lite
//!
//! # Look inside an archive
//! pagestash inspect ./archives/Example_Domain.pgz --format json
//!
//! # Show the effective configuration
//! pagestash config
//! ```
//!
//! Global flags (`--verbose`, `--quiet`, `--debug`, `--no-color`) apply to
//! every command.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::output::OutputFormat;

/// Main CLI structure for the `pagestash` command
#[derive(Parser, Clone, Debug)]
#[command(name = "pagestash")]
#[command(version)]
#[command(about = "pagestash - Capture web pages into single-file archives", long_about = None)]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Suppress informational messages (only show errors)
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Debug logging, including per-request cache activity
    #[arg(long, global = true)]
    pub debug: bool,

    /// Disable all ANSI colors in output (also respects `NO_COLOR` env)
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Configuration file to use instead of the default location
    #[arg(long, global = true, env = "PAGESTASH_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Available subcommands
#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Capture a page and everything it loads into an archive
    Capture(CaptureArgs),

    /// Show what an archive contains
    Inspect {
        /// Archive file
        archive: PathBuf,

        /// Output format
        #[arg(short = 'f', long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration
    Config {
        /// Output format
        #[arg(short = 'f', long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

/// Arguments for `pagestash capture`
#[derive(Args, Clone, Debug)]
pub struct CaptureArgs {
    /// Page to capture (http or https)
    pub url: String,

    /// Directory to write the archive to (defaults to the stash directory)
    #[arg(short = 'o', long, value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// How long the network must stay idle before the capture is packaged
    #[arg(long, value_name = "MS")]
    pub quiet_period_ms: Option<u64>,

    /// Upper bound on the whole capture
    #[arg(long, value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Capture the canonical page even when an AMP version is advertised
    #[arg(long)]
    pub no_amp: bool,

    /// Browser profile mode to apply; repeat to stack modes
    #[arg(long = "mode", value_name = "MODE")]
    pub modes: Vec<String>,

    /// Output format for the capture summary
    #[arg(short = 'f', long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl Cli {
    /// Output format the selected command will print in.
    pub const fn format(&self) -> OutputFormat {
        match &self.command {
            Commands::Capture(args) => args.format,
            Commands::Inspect { format, .. } | Commands::Config { format } => *format,
        }
    }
}
