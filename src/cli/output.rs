//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::{CalibrationError, ErrorClass};

/// Map domain errors to a string for CLI output.
pub fn map_error(e: &CalibrationError) -> String {
    match e {
        CalibrationError::Busy(_) => format!("{}. Wait for it to finish or cancel it.", e),
        _ => e.to_string(),
    }
}

/// Process exit code per error class
pub fn exit_code(e: &CalibrationError) -> i32 {
    match e {
        CalibrationError::Config(_) => 78,
        CalibrationError::Busy(_) => 75,
        _ => match e.class() {
            ErrorClass::Validation => 65,
            ErrorClass::Cancelled => 130,
            ErrorClass::CatalogIntegrity => 70,
            _ => 1,
        },
    }
}
