//! Configuration System
//!
//! Layered configuration for the calibration engine. Sources are merged in order:
//! built-in defaults, the user file at `~/.config/astrocal/config.toml`, the workspace
//! files `config/config.toml` and `config/{ASTROCAL_ENV}.toml`, and finally
//! `ASTROCAL__SECTION__KEY` environment variables.

use crate::error::CalibrationError;
use crate::import::ImportOptions;
use crate::logging::LoggingConfig;
use crate::progress::PrunePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AstrocalConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub grouping: GroupingConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub masters: MastersConfig,

    /// External stacking program
    #[serde(default)]
    pub combiner: ToolConfig,

    /// External calibration program
    #[serde(default)]
    pub calibrator: ToolConfig,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub import: ImportConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled database directory
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    /// Root under which `Masters/` is laid out
    #[serde(default = "default_library_root")]
    pub library_root: PathBuf,

    /// Where calibrated lights are written, one directory per object
    #[serde(default = "default_calibrated_dir")]
    pub calibrated_dir: PathBuf,
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from(".astrocal/catalog")
}

fn default_library_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_calibrated_dir() -> PathBuf {
    PathBuf::from("Calibrated")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            catalog_path: default_catalog_path(),
            library_root: default_library_root(),
            calibrated_dir: default_calibrated_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Span of one observing night, measured from its first frame
    #[serde(default = "default_night_window_hours")]
    pub night_window_hours: f64,
}

fn default_night_window_hours() -> f64 {
    16.0
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            night_window_hours: default_night_window_hours(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_dark_tolerance")]
    pub dark_temperature_tolerance_c: f64,
}

fn default_dark_tolerance() -> f64 {
    5.0
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            dark_temperature_tolerance_c: default_dark_tolerance(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MastersConfig {
    #[serde(default = "default_min_frames")]
    pub min_frames_per_master: usize,

    /// Masters scoring below this are discarded; unset disables the gate
    #[serde(default)]
    pub min_quality: Option<u8>,
}

fn default_min_frames() -> usize {
    crate::master::DEFAULT_MIN_FRAMES_PER_MASTER
}

impl Default for MastersConfig {
    fn default() -> Self {
        Self {
            min_frames_per_master: default_min_frames(),
            min_quality: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Arguments placed before the generated ones
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Content-addressed mirror directory used as the archive
    #[serde(default)]
    pub mirror_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    #[serde(default)]
    pub follow_symlinks: bool,

    #[serde(default = "default_skip_dirs")]
    pub skip_dirs: Vec<String>,
}

fn default_extensions() -> Vec<String> {
    ImportOptions::default().extensions
}

fn default_skip_dirs() -> Vec<String> {
    ImportOptions::default().skip_dirs
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            follow_symlinks: false,
            skip_dirs: default_skip_dirs(),
        }
    }
}

impl ImportConfig {
    pub fn options(&self) -> ImportOptions {
        ImportOptions {
            extensions: self
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            follow_symlinks: self.follow_symlinks,
            skip_dirs: self.skip_dirs.clone(),
        }
    }
}

/// Job history retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_finished")]
    pub max_finished: usize,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

fn default_max_finished() -> usize {
    PrunePolicy::default().max_finished
}

fn default_max_age_days() -> u64 {
    PrunePolicy::default().max_age_ms / (24 * 60 * 60 * 1000)
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_finished: default_max_finished(),
            max_age_days: default_max_age_days(),
        }
    }
}

impl JobsConfig {
    pub fn prune_policy(&self) -> PrunePolicy {
        PrunePolicy {
            max_finished: self.max_finished,
            max_age_ms: self.max_age_days.saturating_mul(24 * 60 * 60 * 1000),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Storage(String),
    Grouping(String),
    Matching(String),
    Masters(String),
    Tool(&'static str, String),
    Import(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Storage(msg) => write!(f, "storage: {}", msg),
            ValidationError::Grouping(msg) => write!(f, "grouping: {}", msg),
            ValidationError::Matching(msg) => write!(f, "matching: {}", msg),
            ValidationError::Masters(msg) => write!(f, "masters: {}", msg),
            ValidationError::Tool(name, msg) => write!(f, "{}: {}", name, msg),
            ValidationError::Import(msg) => write!(f, "import: {}", msg),
            ValidationError::Logging(msg) => write!(f, "logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl AstrocalConfig {
    /// Validate the entire configuration, collecting every problem
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.storage.catalog_path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage("catalog_path cannot be empty".into()));
        }
        if self.storage.library_root.as_os_str().is_empty() {
            errors.push(ValidationError::Storage("library_root cannot be empty".into()));
        }

        let hours = self.grouping.night_window_hours;
        if !hours.is_finite() || hours <= 0.0 || hours > 48.0 {
            errors.push(ValidationError::Grouping(format!(
                "night_window_hours must be in (0, 48], got {}",
                hours
            )));
        }

        let tolerance = self.matching.dark_temperature_tolerance_c;
        if !tolerance.is_finite() || tolerance < 0.0 {
            errors.push(ValidationError::Matching(format!(
                "dark_temperature_tolerance_c must be a non-negative number, got {}",
                tolerance
            )));
        }

        if self.masters.min_frames_per_master < 2 {
            errors.push(ValidationError::Masters(format!(
                "min_frames_per_master must be at least 2, got {}",
                self.masters.min_frames_per_master
            )));
        }
        if let Some(q) = self.masters.min_quality {
            if q > 100 {
                errors.push(ValidationError::Masters(format!(
                    "min_quality is a 0-100 score, got {}",
                    q
                )));
            }
        }

        for (name, tool) in [("combiner", &self.combiner), ("calibrator", &self.calibrator)] {
            if let Some(program) = &tool.program {
                if program.as_os_str().is_empty() {
                    errors.push(ValidationError::Tool(name, "program cannot be empty".into()));
                }
            }
        }

        if self.import.extensions.is_empty() {
            errors.push(ValidationError::Import("extensions cannot be empty".into()));
        }

        if !matches!(self.logging.format.as_str(), "json" | "text") {
            errors.push(ValidationError::Logging(format!(
                "format must be 'json' or 'text', got '{}'",
                self.logging.format
            )));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Make relative storage and tool paths absolute against `root`
    pub fn resolve_paths(&mut self, root: &Path) {
        let absolute = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = root.join(&*p);
            }
        };
        absolute(&mut self.storage.catalog_path);
        absolute(&mut self.storage.library_root);
        absolute(&mut self.storage.calibrated_dir);
        if let Some(mirror) = self.cloud.mirror_root.as_mut() {
            absolute(mirror);
        }
        absolute(&mut self.logging.file);
    }

    /// Render as TOML, e.g. for `astrocal config`
    pub fn to_toml(&self) -> Result<String, CalibrationError> {
        toml::to_string_pretty(self).map_err(|e| CalibrationError::Config(e.to_string()))
    }
}

/// Fold validation problems into one configuration error
pub fn validation_failure(errors: &[ValidationError]) -> CalibrationError {
    let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    CalibrationError::Config(format!(
        "Configuration validation failed:\n{}",
        msgs.join("\n")
    ))
}

/// Loads the layered configuration
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load every layer for a workspace
    pub fn load(workspace_root: &Path) -> Result<AstrocalConfig, CalibrationError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = builder.add_source(
            config::Environment::with_prefix("ASTROCAL")
                .separator("__")
                .try_parsing(true),
        );
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load defaults plus a single file, ignoring every other layer
    pub fn load_from_file(path: &Path) -> Result<AstrocalConfig, CalibrationError> {
        let builder = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path).required(true));
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn default() -> AstrocalConfig {
        AstrocalConfig::default()
    }

    pub fn xdg_config_path() -> Option<PathBuf> {
        global_config_path()
    }
}
