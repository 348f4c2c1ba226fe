//! Shared test utilities for integration tests
//!
//! A temporary library with sidecar headers, an isolated catalog, and in-process stand-ins
//! for the combiner, calibrator, quality assessor and cloud archive.

use astrocal::api::{CalibrationApi, Collaborators};
use astrocal::catalog::Catalog;
use astrocal::collaborators::{
    hash_file, CalibrationRequest, Calibrator, CloudStorage, CombineOutput, CombinePolicy,
    Combiner, FrameMetadata, QualityAssessor, SidecarMetadata,
};
use astrocal::config::AstrocalConfig;
use astrocal::error::CalibrationError;
use astrocal::header::{Binning, FieldMap, FrameKind};
use astrocal::progress::CancellationToken;
use astrocal::types::{to_hex, Hash};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

/// Header of a T1 / I1, bin 1x1, gain 100, offset 10 exposure
pub fn header(kind: FrameKind, exposure_s: f64, observed_at: DateTime<Utc>) -> FieldMap {
    FieldMap::new()
        .with_frame_kind(kind)
        .with_telescope("T1")
        .with_instrument("I1")
        .with_binning(Binning::new(1, 1))
        .with_gain(100)
        .with_offset(10)
        .with_exposure(exposure_s)
        .with_observed_at(observed_at)
}

pub fn light(object: &str, filter: &str, exposure_s: f64, observed_at: DateTime<Utc>) -> FieldMap {
    header(FrameKind::Light, exposure_s, observed_at)
        .with_object(object)
        .with_filter(filter)
}

/// Stacks by concatenating inputs; can cancel a token or fail on demand
#[derive(Default)]
pub struct FakeCombiner {
    pub calls: Mutex<Vec<(FrameKind, usize, CombinePolicy)>>,
    pub cancel_on_call: Mutex<Option<CancellationToken>>,
    pub fail: AtomicBool,
    /// Held by a test to park the combiner mid-job
    pub hold: Mutex<()>,
    counter: AtomicUsize,
}

impl Combiner for FakeCombiner {
    fn combine(
        &self,
        kind: FrameKind,
        inputs: &[PathBuf],
        policy: &CombinePolicy,
        output_dir: &Path,
    ) -> Result<CombineOutput, CalibrationError> {
        drop(self.hold.lock());
        self.calls.lock().push((kind, inputs.len(), *policy));
        if let Some(token) = self.cancel_on_call.lock().as_ref() {
            token.cancel();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CalibrationError::external("combiner", "exited with status 2"));
        }

        std::fs::create_dir_all(output_dir).unwrap();
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let path = output_dir.join(format!("stack_{}_{}.fits", kind.as_str(), n));
        let mut body = format!("MASTER {} #{}\n", kind.as_str(), n).into_bytes();
        for input in inputs {
            body.extend(std::fs::read(input).unwrap());
        }
        std::fs::write(&path, body).unwrap();
        Ok(CombineOutput {
            path,
            frame_count: inputs.len(),
        })
    }
}

/// Writes `<stem>_cal.fits` next to nothing but the requested output dir
#[derive(Default)]
pub struct FakeCalibrator {
    pub requests: Mutex<Vec<CalibrationRequest>>,
    /// Light file names that fail
    pub fail_for: Mutex<Vec<String>>,
}

impl Calibrator for FakeCalibrator {
    fn calibrate(&self, request: &CalibrationRequest) -> Result<PathBuf, CalibrationError> {
        self.requests.lock().push(request.clone());
        let name = request
            .light
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.fail_for.lock().contains(&name) {
            return Err(CalibrationError::external("calibrator", format!("cannot open {}", name)));
        }
        std::fs::create_dir_all(&request.output_dir).unwrap();
        let stem = request.light.file_stem().unwrap().to_string_lossy().into_owned();
        let output = request.output_dir.join(format!("{}_cal.fits", stem));
        if output.exists() {
            return Err(CalibrationError::external(
                "calibrator",
                format!("output {:?} already exists", output),
            ));
        }
        let mut body = b"CALIBRATED\n".to_vec();
        body.extend(std::fs::read(&request.light).unwrap());
        std::fs::write(&output, body).unwrap();
        Ok(output)
    }
}

pub struct FixedQuality(pub Option<u8>);

impl QualityAssessor for FixedQuality {
    fn score(&self, _path: &Path) -> Option<u8> {
        self.0
    }
}

/// What `exists` answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistsAnswer {
    /// Whether the object was uploaded
    Truthful,
    AlwaysFalse,
    Error,
}

/// In-memory archive keyed by content hash
pub struct MemoryCloud {
    pub objects: Mutex<HashMap<Hash, Vec<u8>>>,
    pub answer: Mutex<ExistsAnswer>,
    pub uploads: AtomicUsize,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            answer: Mutex::new(ExistsAnswer::Truthful),
            uploads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CloudStorage for MemoryCloud {
    async fn exists(&self, hash: &Hash) -> Result<bool, CalibrationError> {
        match *self.answer.lock() {
            ExistsAnswer::Truthful => Ok(self.objects.lock().contains_key(hash)),
            ExistsAnswer::AlwaysFalse => Ok(false),
            ExistsAnswer::Error => Err(CalibrationError::external("cloud", "503 service unavailable")),
        }
    }

    async fn upload(&self, path: &Path, hash: &Hash) -> Result<String, CalibrationError> {
        let bytes = std::fs::read(path).map_err(astrocal::error::StorageError::from)?;
        self.objects.lock().insert(*hash, bytes);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("memory://{}", to_hex(hash)))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), CalibrationError> {
        let key = url.trim_start_matches("memory://");
        let found = self
            .objects
            .lock()
            .iter()
            .find(|(h, _)| to_hex(h) == key)
            .map(|(_, b)| b.clone());
        match found {
            Some(bytes) => {
                std::fs::write(dest, bytes).map_err(astrocal::error::StorageError::from)?;
                Ok(())
            }
            None => Err(CalibrationError::NotFound(url.to_string())),
        }
    }
}

/// A temporary workspace: raw exposures under `raw/`, catalog, fakes and the API
pub struct Harness {
    pub dir: TempDir,
    pub config: AstrocalConfig,
    pub catalog: Arc<Catalog>,
    pub combiner: Arc<FakeCombiner>,
    pub calibrator: Arc<FakeCalibrator>,
    pub cloud: Arc<MemoryCloud>,
    pub quality: Arc<FixedQuality>,
    pub api: CalibrationApi,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut AstrocalConfig)) -> Self {
        Self::build(adjust, None)
    }

    pub fn with_quality(score: Option<u8>, adjust: impl FnOnce(&mut AstrocalConfig)) -> Self {
        Self::build(adjust, Some(score))
    }

    fn build(adjust: impl FnOnce(&mut AstrocalConfig), quality: Option<Option<u8>>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = AstrocalConfig::default();
        adjust(&mut config);
        config.resolve_paths(dir.path());
        std::fs::create_dir_all(dir.path().join("raw")).unwrap();

        let catalog = Arc::new(Catalog::open(&config.storage.catalog_path).unwrap());
        let combiner = Arc::new(FakeCombiner::default());
        let calibrator = Arc::new(FakeCalibrator::default());
        let cloud = Arc::new(MemoryCloud::default());
        let quality = Arc::new(FixedQuality(quality.flatten()));
        let api = CalibrationApi::with_collaborators(
            config.clone(),
            Arc::clone(&catalog),
            Collaborators {
                metadata: Arc::new(SidecarMetadata),
                combiner: combiner.clone(),
                calibrator: calibrator.clone(),
                quality: quality.clone(),
                cloud: Some(cloud.clone()),
            },
        )
        .unwrap();

        Self {
            dir,
            config,
            catalog,
            combiner,
            calibrator,
            cloud,
            quality,
            api,
        }
    }

    /// Another API over the same catalog and fakes
    pub fn fresh_api(&self) -> CalibrationApi {
        CalibrationApi::with_collaborators(
            self.config.clone(),
            Arc::clone(&self.catalog),
            Collaborators {
                metadata: Arc::new(SidecarMetadata),
                combiner: self.combiner.clone(),
                calibrator: self.calibrator.clone(),
                quality: self.quality.clone(),
                cloud: Some(self.cloud.clone()),
            },
        )
        .unwrap()
    }

    pub fn raw(&self) -> PathBuf {
        self.dir.path().join("raw")
    }

    /// Write an exposure and its sidecar header under `raw/`
    pub fn exposure(&self, name: &str, fields: &FieldMap) -> PathBuf {
        let path = self.raw().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, format!("SIMPLE = T / {}", name)).unwrap();
        SidecarMetadata.write_header(&path, fields).unwrap();
        path
    }

    /// `count` exposures named `<prefix>_<i>.fits`, one minute apart
    pub fn series(&self, prefix: &str, count: usize, fields: impl Fn(DateTime<Utc>) -> FieldMap, start: DateTime<Utc>) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let t = start + chrono::Duration::minutes(i as i64);
                self.exposure(&format!("{}_{:03}.fits", prefix, i), &fields(t))
            })
            .collect()
    }

    /// Import everything under `raw/` and regroup
    pub fn import_and_group(&self) {
        let report = self.api.import_directory(&self.raw()).unwrap();
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert!(report.invalid.is_empty(), "{:?}", report.invalid);
        self.api.regenerate_sessions(true).unwrap();
    }

    pub fn hash_of(&self, path: &Path) -> Hash {
        hash_file(path).unwrap()
    }
}
