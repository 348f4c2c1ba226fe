//! CLI command-name contract for logging and routing.

use crate::cli::parse::Commands;

/// Stable command name, e.g. "validate-masters"
pub fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Import { .. } => "import",
        Commands::Regenerate { .. } => "regenerate",
        Commands::Sessions { .. } => "sessions",
        Commands::Resolve { .. } => "resolve",
        Commands::Calibrate { .. } => "calibrate",
        Commands::Master { .. } => "master",
        Commands::Retention { .. } => "retention",
        Commands::ValidateMasters { .. } => "validate-masters",
        Commands::Jobs { .. } => "jobs",
        Commands::Config => "config",
    }
}
