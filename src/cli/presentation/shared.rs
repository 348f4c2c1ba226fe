//! Shared presentation helpers: json rendering, status colouring, outcome lists.

use crate::error::CalibrationError;
use crate::orchestrator::ItemOutcome;
use chrono::{TimeZone, Utc};
use owo_colors::OwoColorize;
use serde::Serialize;

pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, CalibrationError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CalibrationError::Config(format!("Failed to render json: {}", e)))
}

/// Whether text output is coloured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    pub color: bool,
}

impl Palette {
    pub fn good(&self, text: &str) -> String {
        if self.color {
            text.green().to_string()
        } else {
            text.to_string()
        }
    }

    pub fn warn(&self, text: &str) -> String {
        if self.color {
            text.yellow().to_string()
        } else {
            text.to_string()
        }
    }

    pub fn bad(&self, text: &str) -> String {
        if self.color {
            text.red().bold().to_string()
        } else {
            text.to_string()
        }
    }

    pub fn title(&self, text: &str) -> String {
        if self.color {
            text.bold().underline().to_string()
        } else {
            text.to_string()
        }
    }
}

/// `Title (n):` followed by one indented line per outcome; empty when there are none
pub fn outcome_section(title: &str, outcomes: &[ItemOutcome]) -> String {
    if outcomes.is_empty() {
        return String::new();
    }
    let mut s = format!("\n\n{} ({}):", title, outcomes.len());
    for o in outcomes {
        s.push_str(&format!("\n  - {}: {}", o.item, o.reason));
    }
    s
}

pub fn format_millis(ms: u64) -> String {
    match Utc.timestamp_millis_opt(ms as i64).single() {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

pub fn new_table() -> comfy_table::Table {
    let mut table = comfy_table::Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table
}

pub fn dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
