//! Error types for the calibration engine.

use std::path::PathBuf;
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Catalog database error: {0}")]
    Database(String),

    #[error("Failed to encode or decode catalog record: {0}")]
    Serialization(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Refusing to overwrite existing file {0:?}")]
    AlreadyExists(PathBuf),
}

/// Input that cannot be processed as given
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Session {session} has {active} active frames; at least {required} are required")]
    InsufficientFrames {
        session: String,
        active: usize,
        required: usize,
    },

    #[error("{path:?} is missing required header field {field}")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("Session {session} already has a master; pass force to rebuild it")]
    MasterExists { session: String },

    #[error("Master quality {score} is below the configured threshold {threshold}")]
    QualityBelowThreshold { score: u8, threshold: u8 },

    #[error("Frame kind {0} cannot be used here")]
    UnsupportedKind(String),
}

/// Errors raised by the grouping, resolution and lifecycle engine
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("No {kind} calibration found for session {session}")]
    ResolutionGap { session: String, kind: String },

    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    #[error("Cloud verification failed for {frame}: {message}")]
    StorageVerification { frame: String, message: String },

    #[error("Catalog integrity error: {0}")]
    CatalogIntegrity(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Another job is already running: {0}")]
    Busy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse error class, used for summaries and propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    ResolutionGap,
    ExternalToolFailure,
    StorageVerificationFailure,
    CatalogIntegrity,
    Cancelled,
    Internal,
}

impl CalibrationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CalibrationError::Validation(_) => ErrorClass::Validation,
            CalibrationError::ResolutionGap { .. } => ErrorClass::ResolutionGap,
            CalibrationError::ExternalTool { .. } => ErrorClass::ExternalToolFailure,
            CalibrationError::StorageVerification { .. } => {
                ErrorClass::StorageVerificationFailure
            }
            CalibrationError::CatalogIntegrity(_) => ErrorClass::CatalogIntegrity,
            CalibrationError::Cancelled => ErrorClass::Cancelled,
            CalibrationError::Busy(_)
            | CalibrationError::NotFound(_)
            | CalibrationError::Storage(_)
            | CalibrationError::Config(_) => ErrorClass::Internal,
        }
    }

    /// Integrity failures mean the catalog cannot be trusted for further decisions.
    pub fn halts_phase(&self) -> bool {
        matches!(self, CalibrationError::CatalogIntegrity(_))
    }

    pub fn external(tool: impl Into<String>, message: impl Into<String>) -> Self {
        CalibrationError::ExternalTool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for CalibrationError {
    fn from(err: config::ConfigError) -> Self {
        CalibrationError::Config(err.to_string())
    }
}
