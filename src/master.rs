//! Master Frame Lifecycle
//!
//! Reduces a calibration session into a master frame through the external combiner and
//! commits the master, the session pointer and the soft-delete of every source frame as
//! one catalog transaction. Nothing is committed unless the combiner succeeded, the job
//! was not cancelled and the master passed the optional quality gate.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, Frame, LifecycleState, MasterRef};
use crate::collaborators::{CombinePolicy, Combiner, FrameMetadata, QualityAssessor};
use crate::error::{CalibrationError, StorageError, ValidationError};
use crate::header::{keys, FieldMap, FrameKind};
use crate::progress::CancellationToken;
use crate::session::{exposure_label, sanitize, CalibrationSession, EquipmentSignature, Session};
use crate::types::{short_hex, to_hex, Hash, SessionId};

pub const DEFAULT_MIN_FRAMES_PER_MASTER: usize = 3;

const MASTERS_DIR: &str = "Masters";
const WORK_DIR: &str = ".work";

/// A combined calibration frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Master {
    pub hash: Hash,
    pub kind: FrameKind,
    pub source_session: SessionId,
    pub equipment: EquipmentSignature,
    pub exposure_ms: u64,
    pub filter: Option<String>,
    pub temperature_c: Option<f64>,
    pub frame_count: usize,
    pub path: PathBuf,
    pub quality: Option<u8>,
    /// Observation time of the source session; names the file
    pub observed_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

impl Master {
    pub fn reference(&self) -> MasterRef {
        MasterRef {
            hash: self.hash,
            path: self.path.clone(),
        }
    }
}

/// `Masters/<Kind>/<signature>/master_<kind>_<signature>[_<exposure>|_<filter>]_<YYYYMMDD>_<HHMMSS>.fits`
///
/// The anchor time keeps two sessions of the same key on one date apart.
pub fn master_path(library_root: &Path, session: &CalibrationSession) -> PathBuf {
    let slug = session.equipment.slug();
    let mut name = format!("master_{}_{}", session.kind.as_str(), slug);
    match session.kind {
        FrameKind::Dark => {
            name.push('_');
            name.push_str(&exposure_label(session.exposure_ms));
        }
        FrameKind::Flat => {
            name.push('_');
            name.push_str(&session.filter.as_deref().map(sanitize).unwrap_or_else(|| "nofilter".into()));
        }
        _ => {}
    }
    name.push_str(&session.observed_at.format("_%Y%m%d_%H%M%S.fits").to_string());
    library_root
        .join(MASTERS_DIR)
        .join(session.kind.title())
        .join(slug)
        .join(name)
}

/// Outcome of checking a master's backing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum MasterValidation {
    Valid,
    Missing,
    HashMismatch { actual: Hash },
}

impl MasterValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, MasterValidation::Valid)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MasterRequest {
    /// Rebuild even when the session already has a master
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterSettings {
    pub min_frames: usize,
    pub min_quality: Option<u8>,
    pub library_root: PathBuf,
}

pub struct MasterManager {
    catalog: Arc<Catalog>,
    combiner: Arc<dyn Combiner>,
    metadata: Arc<dyn FrameMetadata>,
    quality: Arc<dyn QualityAssessor>,
    settings: MasterSettings,
}

impl MasterManager {
    pub fn new(
        catalog: Arc<Catalog>,
        combiner: Arc<dyn Combiner>,
        metadata: Arc<dyn FrameMetadata>,
        quality: Arc<dyn QualityAssessor>,
        settings: MasterSettings,
    ) -> Self {
        Self {
            catalog,
            combiner,
            metadata,
            quality,
            settings,
        }
    }

    pub fn settings(&self) -> &MasterSettings {
        &self.settings
    }

    /// Frames the combiner would receive. With `force`, members consumed by the session's
    /// current master are included again.
    pub fn eligible_sources(
        &self,
        session: &CalibrationSession,
        force: bool,
    ) -> Result<Vec<Frame>, CalibrationError> {
        let frames = self.catalog.frames_for(&session.frames)?;
        Ok(frames
            .into_iter()
            .filter(|f| {
                f.is_active()
                    || (force
                        && f.lifecycle == LifecycleState::SoftDeleted
                        && f.consumed_by.as_ref().map(|m| m.hash) == session.master
                        && session.master.is_some())
            })
            .collect())
    }

    pub fn create_master(
        &self,
        session: &CalibrationSession,
        request: &MasterRequest,
        cancel: &CancellationToken,
    ) -> Result<Master, CalibrationError> {
        if cancel.is_cancelled() {
            return Err(CalibrationError::Cancelled);
        }
        if !session.kind.is_calibration() {
            return Err(ValidationError::UnsupportedKind(session.kind.as_str().to_string()).into());
        }

        let current = match self.catalog.get_session(&session.id)? {
            Some(Session::Calibration(current)) => current,
            _ => {
                return Err(CalibrationError::NotFound(format!(
                    "calibration session {}",
                    short_hex(&session.id)
                )))
            }
        };
        if current.master.is_some() && !request.force {
            return Err(ValidationError::MasterExists {
                session: short_hex(&current.id),
            }
            .into());
        }

        let sources = self.eligible_sources(&current, request.force)?;
        if sources.len() < self.settings.min_frames {
            return Err(ValidationError::InsufficientFrames {
                session: short_hex(&current.id),
                active: sources.len(),
                required: self.settings.min_frames,
            }
            .into());
        }

        let inputs: Vec<PathBuf> = sources.iter().map(|f| f.path.clone()).collect();
        let policy = CombinePolicy::for_kind(current.kind);
        let work_dir = self.settings.library_root.join(MASTERS_DIR).join(WORK_DIR);

        if cancel.is_cancelled() {
            return Err(CalibrationError::Cancelled);
        }
        debug!(
            session = %short_hex(&current.id),
            kind = %current.kind,
            frames = inputs.len(),
            "Combining calibration session"
        );
        let output = self.combiner.combine(current.kind, &inputs, &policy, &work_dir)?;

        if cancel.is_cancelled() {
            discard(&output.path);
            return Err(CalibrationError::Cancelled);
        }
        if output.frame_count == 0 {
            discard(&output.path);
            return Err(CalibrationError::external(
                "combiner",
                "reported zero combined frames",
            ));
        }

        let quality = self.quality.score(&output.path);
        if let (Some(threshold), Some(score)) = (self.settings.min_quality, quality) {
            if score < threshold {
                discard(&output.path);
                return Err(ValidationError::QualityBelowThreshold { score, threshold }.into());
            }
        }

        let replaces = if request.force { current.master } else { None };
        let previous = match replaces {
            Some(old) => self.catalog.get_master(&old)?,
            None => None,
        };

        let dest = master_path(&self.settings.library_root, &current);
        let stash = match vacate(&dest, previous.as_ref(), &work_dir) {
            Ok(stash) => stash,
            Err(err) => {
                discard(&output.path);
                return Err(err.into());
            }
        };
        if let Err(err) = place(&output.path, &dest) {
            discard(&output.path);
            restore(stash.as_deref(), &dest);
            return Err(err.into());
        }
        if let Err(err) = self.metadata.write_header(&dest, &provenance_fields(&current, output.frame_count)) {
            discard(&dest);
            restore(stash.as_deref(), &dest);
            return Err(err);
        }
        let hash = match self.metadata.content_hash(&dest) {
            Ok(hash) => hash,
            Err(err) => {
                discard(&dest);
                restore(stash.as_deref(), &dest);
                return Err(err);
            }
        };

        let master = Master {
            hash,
            kind: current.kind,
            source_session: current.id,
            equipment: current.equipment.clone(),
            exposure_ms: current.exposure_ms,
            filter: current.filter.clone(),
            temperature_c: current.temperature_c,
            frame_count: output.frame_count,
            path: dest,
            quality,
            observed_at: current.observed_at,
            processed_at: Utc::now(),
        };

        let source_hashes: Vec<Hash> = sources.iter().map(|f| f.hash).collect();
        if let Err(err) = self.catalog.commit_master(&master, &source_hashes, replaces) {
            discard(&master.path);
            restore(stash.as_deref(), &master.path);
            return Err(err);
        }
        if let Some(stash) = &stash {
            discard(stash);
        }
        if let Some(previous) = previous.filter(|p| p.path != master.path) {
            discard(&previous.path);
        }

        info!(
            session = %short_hex(&current.id),
            kind = %master.kind,
            master = %short_hex(&master.hash),
            frames = master.frame_count,
            path = ?master.path,
            "Created master"
        );
        Ok(master)
    }

    /// Check a master's file against its recorded content hash. Never repairs.
    pub fn validate_master(&self, master: &Master) -> Result<MasterValidation, CalibrationError> {
        if !master.path.exists() {
            warn!(master = %short_hex(&master.hash), path = ?master.path, "Master file is missing");
            return Ok(MasterValidation::Missing);
        }
        let actual = self.metadata.content_hash(&master.path)?;
        if actual != master.hash {
            warn!(
                master = %short_hex(&master.hash),
                actual = %short_hex(&actual),
                "Master file content changed"
            );
            return Ok(MasterValidation::HashMismatch { actual });
        }
        Ok(MasterValidation::Valid)
    }
}

fn provenance_fields(session: &CalibrationSession, frame_count: usize) -> FieldMap {
    let mut fields = FieldMap::new()
        .with_telescope(session.equipment.telescope.clone())
        .with_instrument(session.equipment.instrument.clone())
        .with_binning(session.equipment.binning)
        .with_exposure(session.exposure_ms as f64 / 1000.0)
        .with_observed_at(session.observed_at)
        .with_extra(
            keys::IMAGE_TYPE,
            format!("MASTER {}", session.kind.as_str().to_ascii_uppercase()),
        )
        .with_extra(keys::NCOMBINE, frame_count.to_string())
        .with_extra("MSESSION", to_hex(&session.id));
    if let Some(gain) = session.equipment.gain {
        fields = fields.with_gain(gain);
    }
    if let Some(offset) = session.equipment.offset {
        fields = fields.with_offset(offset);
    }
    if let Some(filter) = &session.filter {
        fields = fields.with_filter(filter.clone());
    }
    if let Some(temperature) = session.temperature_c {
        fields = fields.with_temperature(temperature);
    }
    fields
}

/// Clear `dest` for a new master. Only the master being replaced may occupy it; that file
/// is moved into the work directory and the stash path returned.
fn vacate(
    dest: &Path,
    replaced: Option<&Master>,
    work_dir: &Path,
) -> Result<Option<PathBuf>, StorageError> {
    if !dest.exists() {
        return Ok(None);
    }
    if replaced.map(|m| m.path.as_path()) != Some(dest) {
        warn!(path = ?dest, "Master path already occupied");
        return Err(StorageError::AlreadyExists(dest.to_path_buf()));
    }
    let name = dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let stash = work_dir.join(format!("{}.replaced", name));
    fs::create_dir_all(work_dir)?;
    fs::rename(dest, &stash)?;
    Ok(Some(stash))
}

/// Put a stashed master back after a failed rebuild
fn restore(stash: Option<&Path>, dest: &Path) {
    let Some(stash) = stash else {
        return;
    };
    if let Err(err) = fs::rename(stash, dest) {
        warn!(path = ?dest, stash = ?stash, error = %err, "Failed to restore replaced master");
    }
}

/// Move the combiner output into the library, copying across filesystems. Never overwrites.
fn place(source: &Path, dest: &Path) -> Result<(), StorageError> {
    if dest.exists() {
        return Err(StorageError::AlreadyExists(dest.to_path_buf()));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(source, dest).is_ok() {
        return Ok(());
    }
    fs::copy(source, dest)?;
    fs::remove_file(source)?;
    Ok(())
}

fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = ?path, error = %err, "Failed to remove discarded output");
        }
    }
}
