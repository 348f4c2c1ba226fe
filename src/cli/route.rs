//! CLI route: single route table and run context. Dispatches to the calibration API and
//! presentation.

use crate::api::CalibrationApi;
use crate::cli::command_name;
use crate::cli::parse::{Commands, OutputFormat, SessionKindFilter};
use crate::cli::presentation::{
    format_config, format_import, format_jobs, format_master, format_master_checks,
    format_regeneration,
    format_resolution, format_retention, format_sessions, format_summary, Palette,
};
use crate::config::{AstrocalConfig, ConfigLoader};
use crate::error::CalibrationError;
use crate::progress::ProgressUpdate;
use crate::retention::RetentionPolicy;
use crate::session::Session;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Runtime context for CLI execution: workspace, effective config and the API.
pub struct RunContext {
    api: CalibrationApi,
    workspace_root: PathBuf,
    palette: Palette,
}

/// Load config from an explicit file, or every layer for the workspace
pub fn load_config(
    workspace_root: &Path,
    config_path: Option<&Path>,
) -> Result<AstrocalConfig, CalibrationError> {
    match config_path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(workspace_root),
    }
}

impl RunContext {
    pub fn new(
        workspace_root: PathBuf,
        config: AstrocalConfig,
        progress: bool,
        color: bool,
    ) -> Result<Self, CalibrationError> {
        let mut api = CalibrationApi::open(&workspace_root, config)?;
        if progress {
            api = api.with_progress(Arc::new(|update: ProgressUpdate| {
                let item = update
                    .current_item
                    .map(|i| format!(" [{}]", i))
                    .unwrap_or_default();
                eprintln!(
                    "({}/{}) {}{}",
                    update.phase_index, update.phase_total, update.message, item
                );
            }));
        }
        Ok(Self {
            api,
            workspace_root,
            palette: Palette { color },
        })
    }

    pub fn api(&self) -> &CalibrationApi {
        &self.api
    }

    /// Execute a CLI command via the single route table.
    pub fn execute(&self, command: &Commands) -> Result<String, CalibrationError> {
        let started = Instant::now();
        let result = self.execute_inner(command);
        info!(
            command = command_name(command),
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        result
    }

    fn execute_inner(&self, command: &Commands) -> Result<String, CalibrationError> {
        let palette = self.palette;
        match command {
            Commands::Import { path, format } => {
                let root = if path.is_relative() {
                    self.workspace_root.join(path)
                } else {
                    path.clone()
                };
                let report = self.api.import_directory(&root)?;
                format_import(&report, *format, palette)
            }
            Commands::Regenerate { force, format } => {
                let report = self.api.regenerate_sessions(*force)?;
                format_regeneration(&report, *format)
            }
            Commands::Sessions { kind, format } => {
                let sessions: Vec<Session> = self
                    .api
                    .sessions()?
                    .into_iter()
                    .filter(|s| match kind {
                        SessionKindFilter::All => true,
                        SessionKindFilter::Light => s.as_light().is_some(),
                        SessionKindFilter::Calibration => s.as_calibration().is_some(),
                    })
                    .collect();
                format_sessions(&sessions, *format, palette)
            }
            Commands::Resolve { session, format } => {
                let found = self.api.find_session(session)?;
                let Session::Light(light) = found else {
                    return Err(CalibrationError::NotFound(format!(
                        "{} is a calibration session; resolve takes a light session",
                        session
                    )));
                };
                let resolution = self.api.resolve(&light.id)?;
                format_resolution(&light, &resolution, *format, palette)
            }
            Commands::Calibrate {
                dry_run,
                session,
                format,
            } => {
                let filter = match session {
                    Some(prefix) => Some(self.api.find_session(prefix)?.id()),
                    None => None,
                };
                let summary = self.api.run_auto_calibration(*dry_run, filter)?;
                format_summary(&summary, *format, palette)
            }
            Commands::Master {
                session,
                force,
                format,
            } => {
                let found = self.api.find_session(session)?;
                let master = self.api.create_master(&found.id(), *force)?;
                format_master(&master, *format, palette)
            }
            Commands::Retention { policy, format } => {
                let policy: RetentionPolicy = policy.parse().map_err(CalibrationError::Config)?;
                let report = self.api.apply_retention(policy)?;
                format_retention(&report, *format, palette)
            }
            Commands::ValidateMasters { format } => {
                let checks = self.api.validate_masters()?;
                format_master_checks(&checks, *format, palette)
            }
            Commands::Jobs { limit, format } => {
                let mut jobs = self.api.jobs()?;
                jobs.truncate(*limit);
                format_jobs(&jobs, *format, palette)
            }
            Commands::Config => format_config(self.api.config(), palette),
        }
    }
}

/// `--format json` requested for this command
pub fn wants_json(command: &Commands) -> bool {
    let format = match command {
        Commands::Import { format, .. }
        | Commands::Regenerate { format, .. }
        | Commands::Sessions { format, .. }
        | Commands::Resolve { format, .. }
        | Commands::Calibrate { format, .. }
        | Commands::Master { format, .. }
        | Commands::Retention { format, .. }
        | Commands::ValidateMasters { format }
        | Commands::Jobs { format, .. } => *format,
        Commands::Config => OutputFormat::Text,
    };
    format == OutputFormat::Json
}
