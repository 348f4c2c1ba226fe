//! Sessions
//!
//! Frames sharing acquisition context. Light sessions group by target, observing night and
//! optics; calibration sessions group by frame kind, equipment signature and night.

pub mod cache;
pub mod grouper;

pub use cache::SessionIndex;
pub use grouper::SessionGrouper;

use crate::header::{Binning, FrameKind};
use crate::types::{FrameHash, Hash, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Equipment fields that must match exactly between a light and its calibration data
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EquipmentSignature {
    pub telescope: String,
    pub instrument: String,
    pub binning: Binning,
    pub gain: Option<i32>,
    pub offset: Option<i32>,
}

impl EquipmentSignature {
    /// Filesystem-safe rendering, used for the `Masters/` tree and master filenames
    pub fn slug(&self) -> String {
        let opt = |v: Option<i32>| v.map(|n| n.to_string()).unwrap_or_else(|| "na".to_string());
        format!(
            "{}_{}_{}_g{}_o{}",
            sanitize(&self.telescope),
            sanitize(&self.instrument),
            self.binning,
            opt(self.gain),
            opt(self.offset)
        )
    }
}

impl fmt::Display for EquipmentSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} bin {} gain {} offset {}",
            self.telescope,
            self.instrument,
            self.binning,
            self.gain.map(|g| g.to_string()).unwrap_or_else(|| "-".into()),
            self.offset.map(|o| o.to_string()).unwrap_or_else(|| "-".into()),
        )
    }
}

/// Replace anything outside `[A-Za-z0-9.-]` with `-`
pub fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Light frames of one target, observing night and optical train
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSession {
    pub id: SessionId,
    pub object: Option<String>,
    pub equipment: EquipmentSignature,
    /// Distinct filters in use; `None` is an unfiltered exposure
    pub filters: Vec<Option<String>>,
    /// Most common exposure
    pub exposure_ms: u64,
    /// Distinct exposures in use, ascending; each needs its own dark
    pub exposures: Vec<u64>,
    pub temperature_c: Option<f64>,
    /// Earliest member timestamp
    pub observed_at: DateTime<Utc>,
    /// Member frame hashes, ordered by observation time
    pub frames: Vec<FrameHash>,
}

/// Calibration frames of one kind sharing an equipment signature and night
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSession {
    pub id: SessionId,
    pub kind: FrameKind,
    pub equipment: EquipmentSignature,
    pub exposure_ms: u64,
    pub filter: Option<String>,
    pub temperature_c: Option<f64>,
    pub observed_at: DateTime<Utc>,
    pub frames: Vec<FrameHash>,
    /// Content hash of the master built from this session
    pub master: Option<Hash>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Session {
    Light(LightSession),
    Calibration(CalibrationSession),
}

impl Session {
    pub fn id(&self) -> SessionId {
        match self {
            Session::Light(s) => s.id,
            Session::Calibration(s) => s.id,
        }
    }

    pub fn frames(&self) -> &[FrameHash] {
        match self {
            Session::Light(s) => &s.frames,
            Session::Calibration(s) => &s.frames,
        }
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        match self {
            Session::Light(s) => s.observed_at,
            Session::Calibration(s) => s.observed_at,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Session::Light(_) => "light",
            Session::Calibration(s) => s.kind.as_str(),
        }
    }

    pub fn as_light(&self) -> Option<&LightSession> {
        match self {
            Session::Light(s) => Some(s),
            Session::Calibration(_) => None,
        }
    }

    pub fn as_calibration(&self) -> Option<&CalibrationSession> {
        match self {
            Session::Light(_) => None,
            Session::Calibration(s) => Some(s),
        }
    }
}

/// Filter name used as a map key; unfiltered is the empty string
pub fn filter_key(filter: &Option<String>) -> String {
    filter.clone().unwrap_or_default()
}

/// `300s` for whole seconds, `1500ms` otherwise
pub fn exposure_label(exposure_ms: u64) -> String {
    if exposure_ms % 1000 == 0 {
        format!("{}s", exposure_ms / 1000)
    } else {
        format!("{}ms", exposure_ms)
    }
}
