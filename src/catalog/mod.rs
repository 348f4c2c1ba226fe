//! Frame Catalog
//!
//! Durable store of exposure records, their session grouping, calibration links and
//! master frames. The catalog is the single source of truth; every multi-record change
//! (a master plus the soft-deletes of its sources, a full regrouping) commits as one
//! transaction.

pub mod persistence;

pub use persistence::{Catalog, Grouping};

use crate::error::ValidationError;
use crate::header::{Binning, FieldMap, FrameKind};
use crate::session::EquipmentSignature;
use crate::types::{FrameHash, Hash, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Calibration status of a light frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStatus {
    Uncalibrated,
    Calibrated,
}

/// Storage lifecycle of a frame
///
/// `Active → SoftDeleted → PurgedPendingVerification → Purged`. Only the retention
/// manager moves a frame past `SoftDeleted`, and only it removes local files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    SoftDeleted,
    PurgedPendingVerification,
    Purged,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::SoftDeleted => "soft_deleted",
            LifecycleState::PurgedPendingVerification => "purge_pending",
            LifecycleState::Purged => "purged",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Active)
    }

    /// Whether the local file is expected to still exist
    pub fn local_present(self) -> bool {
        !matches!(self, LifecycleState::Purged)
    }
}

/// Remote copy of a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudLocation {
    pub url: String,
    /// Set once an existence check has confirmed the remote copy by content hash
    pub verified: bool,
}

/// Pointer to a master frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRef {
    pub hash: Hash,
    pub path: PathBuf,
}

/// Masters applied to a calibrated light frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProvenance {
    pub bias: Option<MasterRef>,
    pub dark: Option<MasterRef>,
    pub flat: Option<MasterRef>,
    pub output_path: PathBuf,
    pub calibrated_at: DateTime<Utc>,
}

/// Acquisition metadata mirrored from the header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acquisition {
    pub object: Option<String>,
    pub telescope: String,
    pub instrument: String,
    pub filter: Option<String>,
    pub exposure_s: f64,
    pub binning: Binning,
    pub gain: Option<i32>,
    pub offset: Option<i32>,
    pub temperature_c: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

impl Acquisition {
    /// Validate the header fields a frame needs before it can be catalogued.
    ///
    /// Binning defaults to 1x1 when absent; gain, offset, filter, object and
    /// temperature stay optional and match only against the same absence.
    pub fn from_fields(path: &Path, fields: &FieldMap) -> Result<(FrameKind, Self), ValidationError> {
        let missing = |field: &'static str| ValidationError::MissingField {
            path: path.to_path_buf(),
            field,
        };
        let kind = fields.frame_kind().ok_or_else(|| missing("IMAGETYP"))?;
        let telescope = fields.telescope().ok_or_else(|| missing("TELESCOP"))?;
        let instrument = fields.instrument().ok_or_else(|| missing("INSTRUME"))?;
        let exposure_s = fields.exposure_s().ok_or_else(|| missing("EXPTIME"))?;
        let observed_at = fields.observed_at().ok_or_else(|| missing("DATE-OBS"))?;

        Ok((
            kind,
            Acquisition {
                object: fields.object().map(str::to_string),
                telescope: telescope.to_string(),
                instrument: instrument.to_string(),
                filter: fields.filter().map(str::to_string),
                exposure_s,
                binning: fields.binning().unwrap_or_default(),
                gain: fields.gain(),
                offset: fields.offset(),
                temperature_c: fields.temperature_c(),
                observed_at,
            },
        ))
    }

    pub fn equipment(&self) -> EquipmentSignature {
        EquipmentSignature {
            telescope: self.telescope.clone(),
            instrument: self.instrument.clone(),
            binning: self.binning,
            gain: self.gain,
            offset: self.offset,
        }
    }

    /// Exposure in whole milliseconds; exact exposure matching compares this value
    pub fn exposure_ms(&self) -> u64 {
        exposure_to_ms(self.exposure_s)
    }
}

pub fn exposure_to_ms(seconds: f64) -> u64 {
    (seconds * 1000.0).round().max(0.0) as u64
}

/// One catalogued exposure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub hash: FrameHash,
    pub path: PathBuf,
    pub kind: FrameKind,
    pub acquisition: Acquisition,
    pub calibration: CalibrationStatus,
    pub lifecycle: LifecycleState,
    pub cloud: Option<CloudLocation>,
    /// Masters applied when this light was calibrated
    pub provenance: Option<CalibrationProvenance>,
    /// Master this calibration frame was combined into
    pub consumed_by: Option<MasterRef>,
    pub session_id: Option<SessionId>,
}

impl Frame {
    pub fn new(hash: FrameHash, path: PathBuf, kind: FrameKind, acquisition: Acquisition) -> Self {
        Self {
            hash,
            path,
            kind,
            acquisition,
            calibration: CalibrationStatus::Uncalibrated,
            lifecycle: LifecycleState::Active,
            cloud: None,
            provenance: None,
            consumed_by: None,
            session_id: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }
}
