//! External Collaborators
//!
//! Narrow interfaces to everything outside the engine: header I/O and content hashing,
//! the frame combiner, the light calibration application, quality scoring and cloud
//! storage. Each trait ships with one concrete implementation usable from the CLI.

pub mod command;
pub mod mirror;
pub mod sidecar;

pub use command::{CommandCalibrator, CommandCombiner, Unconfigured};
pub use mirror::MirrorStorage;
pub use sidecar::SidecarMetadata;

use crate::error::{CalibrationError, StorageError};
use crate::header::{FieldMap, FrameKind};
use crate::types::Hash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Header access and content hashing for exposure files
pub trait FrameMetadata: Send + Sync {
    fn read_header(&self, path: &Path) -> Result<FieldMap, CalibrationError>;

    /// Merge `fields` into the file's header
    fn write_header(&self, path: &Path, fields: &FieldMap) -> Result<(), CalibrationError>;

    fn content_hash(&self, path: &Path) -> Result<Hash, CalibrationError>;
}

/// Stream a file through BLAKE3
pub fn hash_file(path: &Path) -> Result<Hash, StorageError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(*hasher.finalize().as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rejection {
    SigmaClip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Normalization {
    None,
    Multiplicative,
}

/// How the combiner should stack a calibration session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinePolicy {
    pub rejection: Rejection,
    pub normalization: Normalization,
}

impl CombinePolicy {
    /// Bias and dark: sigma-clip, no normalisation. Flat: sigma-clip, multiplicative.
    pub fn for_kind(kind: FrameKind) -> Self {
        let normalization = match kind {
            FrameKind::Flat => Normalization::Multiplicative,
            _ => Normalization::None,
        };
        Self {
            rejection: Rejection::SigmaClip,
            normalization,
        }
    }
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::SigmaClip => "sigma-clip",
        }
    }
}

impl Normalization {
    pub fn as_str(self) -> &'static str {
        match self {
            Normalization::None => "none",
            Normalization::Multiplicative => "multiplicative",
        }
    }
}

/// Result of a successful combination
#[derive(Debug, Clone, PartialEq)]
pub struct CombineOutput {
    pub path: PathBuf,
    pub frame_count: usize,
}

/// Pixel-level stacking tool. Blocking; may run for minutes.
pub trait Combiner: Send + Sync {
    fn combine(
        &self,
        kind: FrameKind,
        inputs: &[PathBuf],
        policy: &CombinePolicy,
        output_dir: &Path,
    ) -> Result<CombineOutput, CalibrationError>;
}

/// Inputs for calibrating one light frame
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRequest {
    pub light: PathBuf,
    pub bias: Option<PathBuf>,
    pub dark: Option<PathBuf>,
    pub flat: Option<PathBuf>,
    pub output_dir: PathBuf,
}

/// Light calibration application; returns the calibrated output path. An existing file
/// at the output path is an error, never overwritten.
pub trait Calibrator: Send + Sync {
    fn calibrate(&self, request: &CalibrationRequest) -> Result<PathBuf, CalibrationError>;
}

/// Scores a frame 0..=100, or `None` when it cannot
pub trait QualityAssessor: Send + Sync {
    fn score(&self, path: &Path) -> Option<u8>;
}

/// Assessor for setups without a scoring tool
#[derive(Debug, Clone, Copy, Default)]
pub struct Unscored;

impl QualityAssessor for Unscored {
    fn score(&self, _path: &Path) -> Option<u8> {
        None
    }
}

/// Remote object storage keyed by content hash
#[async_trait]
pub trait CloudStorage: Send + Sync {
    /// True only when an object with exactly this content hash is stored
    async fn exists(&self, hash: &Hash) -> Result<bool, CalibrationError>;

    async fn upload(&self, path: &Path, hash: &Hash) -> Result<String, CalibrationError>;

    async fn download(&self, url: &str, dest: &Path) -> Result<(), CalibrationError>;
}
