//! astrocal CLI Binary
//!
//! Command-line interface for session grouping, master creation, light calibration and
//! retention over an astronomical exposure library.

use anyhow::Context;
use astrocal::cli::{
    exit_code, format_config, load_config, map_error, wants_json, Cli, Commands, Palette,
    RunContext,
};
use astrocal::config::AstrocalConfig;
use astrocal::error::CalibrationError;
use astrocal::logging::{init_logging, LoggingConfig};
use clap::Parser;
use std::process;
use tracing::{error, info};

fn main() {
    let cli = Cli::parse();

    // A broken config still gets a logger; the error surfaces from run()
    let loaded = load_config(&cli.workspace, cli.config.as_deref());
    let logging_config = build_logging_config(&cli, loaded.as_ref().ok());
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!(command = astrocal::cli::command_name(&cli.command), "astrocal starting");

    match run(&cli, loaded) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            match e.downcast_ref::<CalibrationError>() {
                Some(err) => {
                    eprintln!("{}", map_error(err));
                    process::exit(exit_code(err));
                }
                None => {
                    eprintln!("{:#}", e);
                    process::exit(1);
                }
            }
        }
    }
}

fn run(cli: &Cli, loaded: Result<AstrocalConfig, CalibrationError>) -> anyhow::Result<String> {
    let config = loaded?;
    let color = !cli.no_color && !wants_json(&cli.command);

    // Inspecting a broken config must not require opening the catalog
    if let Commands::Config = cli.command {
        let mut config = config;
        config.resolve_paths(&cli.workspace);
        return Ok(format_config(&config, Palette { color })?);
    }

    let context = RunContext::new(cli.workspace.clone(), config, cli.progress, color)
        .with_context(|| format!("opening workspace {}", cli.workspace.display()))?;
    Ok(context.execute(&cli.command)?)
}

/// Build logging configuration from CLI args and the config file.
/// Precedence: CLI flags override config file override defaults.
fn build_logging_config(cli: &Cli, config: Option<&AstrocalConfig>) -> LoggingConfig {
    let mut logging = config.map(|c| c.logging.clone()).unwrap_or_default();

    if cli.verbose {
        logging.level = "debug".to_string();
    }
    if let Some(ref level) = cli.log_level {
        logging.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        logging.format = format.clone();
    }
    if let Some(ref output) = cli.log_output {
        logging.output = output.clone();
    }
    if let Some(ref file) = cli.log_file {
        logging.file = file.clone();
    } else if logging.file.is_relative() {
        logging.file = cli.workspace.join(&logging.file);
    }
    logging
}
