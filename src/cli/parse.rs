//! CLI parse: clap types for astrocal. No behavior; definitions only.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// astrocal - session grouping and calibration for astronomical exposure libraries
#[derive(Parser, Debug)]
#[command(name = "astrocal")]
#[command(about = "Group exposures into sessions, build master calibration frames and calibrate lights")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long)]
    pub verbose: bool,

    /// Print phase progress to stderr
    #[arg(long)]
    pub progress: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SessionKindFilter {
    All,
    Light,
    Calibration,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Catalogue every exposure under a directory
    Import {
        /// Directory to scan
        path: PathBuf,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Rebuild sessions and calibration links from the frame catalog
    Regenerate {
        /// Rebuild even when every frame is already grouped
        #[arg(long)]
        force: bool,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// List sessions
    Sessions {
        #[arg(long, value_enum, default_value = "all")]
        kind: SessionKindFilter,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Show which calibration data a light session resolves to
    Resolve {
        /// Light session id or unique prefix
        session: String,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Build missing masters and calibrate lights
    Calibrate {
        /// Analyze only; report what would be done
        #[arg(long)]
        dry_run: bool,
        /// Restrict to one light or calibration session (id or unique prefix)
        #[arg(long)]
        session: Option<String>,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Combine one calibration session into a master frame
    Master {
        /// Calibration session id or unique prefix
        session: String,
        /// Rebuild when the session already has a master
        #[arg(long)]
        force: bool,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Archive soft-deleted frames under a retention policy
    Retention {
        /// backup-only, complete-bidirectional or on-demand
        #[arg(long, default_value = "backup-only")]
        policy: String,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Check every master's file against its recorded content hash
    ValidateMasters {
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Show job history
    Jobs {
        /// Most recent jobs to show
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Print the effective configuration and any validation problems
    Config,
}
