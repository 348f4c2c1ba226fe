//! Sidecar header store
//!
//! Keeps header cards in `<file>.header.json` next to each exposure. Capture software that
//! exports headers this way can be catalogued without a FITS codec; writes merge into the
//! sidecar and never touch the exposure bytes, so content hashes stay stable.

use crate::collaborators::{hash_file, FrameMetadata};
use crate::error::{CalibrationError, StorageError};
use crate::header::FieldMap;
use crate::types::Hash;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const SIDECAR_SUFFIX: &str = "header.json";

#[derive(Debug, Clone, Copy, Default)]
pub struct SidecarMetadata;

impl SidecarMetadata {
    pub fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".");
        name.push(SIDECAR_SUFFIX);
        path.with_file_name(name)
    }

    /// True for files the importer should skip (the sidecars themselves)
    pub fn is_sidecar(path: &Path) -> bool {
        path.to_string_lossy().ends_with(SIDECAR_SUFFIX)
    }

    fn read_cards(path: &Path) -> Result<BTreeMap<String, String>, CalibrationError> {
        let sidecar = Self::sidecar_path(path);
        if !sidecar.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read(&sidecar).map_err(StorageError::from)?;
        let cards: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&raw)
            .map_err(|e| StorageError::Serialization(format!("{:?}: {}", sidecar, e)))?;
        Ok(cards
            .into_iter()
            .map(|(k, v)| {
                let text = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, text)
            })
            .collect())
    }
}

impl FrameMetadata for SidecarMetadata {
    fn read_header(&self, path: &Path) -> Result<FieldMap, CalibrationError> {
        Ok(FieldMap::from_cards(&Self::read_cards(path)?))
    }

    fn write_header(&self, path: &Path, fields: &FieldMap) -> Result<(), CalibrationError> {
        let mut cards = Self::read_cards(path)?;
        cards.extend(fields.to_cards());
        let sidecar = Self::sidecar_path(path);
        let serialized = serde_json::to_vec_pretty(&cards)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let temp = sidecar.with_extension("json.tmp");
        fs::write(&temp, serialized).map_err(StorageError::from)?;
        fs::rename(&temp, &sidecar).map_err(|e| {
            let _ = fs::remove_file(&temp);
            StorageError::from(e)
        })?;
        Ok(())
    }

    fn content_hash(&self, path: &Path) -> Result<Hash, CalibrationError> {
        Ok(hash_file(path)?)
    }
}
