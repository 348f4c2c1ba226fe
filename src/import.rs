//! Frame Importer
//!
//! Walks a directory of exposures and catalogues every file whose header carries the
//! required acquisition fields. Files already catalogued, by path or by content hash, are
//! reported as duplicates and never overwritten.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::catalog::{Acquisition, Catalog, Frame};
use crate::collaborators::{FrameMetadata, SidecarMetadata};
use crate::error::{CalibrationError, StorageError};
use crate::orchestrator::ItemOutcome;
use crate::progress::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    /// File extensions treated as exposures, lowercase without the dot
    pub extensions: Vec<String>,
    pub follow_symlinks: bool,
    /// Directory names never descended into
    pub skip_dirs: Vec<String>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            extensions: vec!["fits".into(), "fit".into(), "fts".into()],
            follow_symlinks: false,
            skip_dirs: vec![".work".into()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub scanned: usize,
    pub imported: usize,
    pub duplicates: Vec<ItemOutcome>,
    /// Files whose headers lack a required field
    pub invalid: Vec<ItemOutcome>,
    pub failures: Vec<ItemOutcome>,
    pub cancelled: bool,
}

pub struct Importer<'a> {
    catalog: &'a Catalog,
    metadata: &'a dyn FrameMetadata,
    options: ImportOptions,
}

impl<'a> Importer<'a> {
    pub fn new(catalog: &'a Catalog, metadata: &'a dyn FrameMetadata, options: ImportOptions) -> Self {
        Self {
            catalog,
            metadata,
            options,
        }
    }

    pub fn import_directory(
        &self,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<ImportReport, CalibrationError> {
        let mut report = ImportReport::default();
        for path in self.exposures(root)? {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.scanned += 1;
            let item = path.display().to_string();

            match self.import_file(&path) {
                Ok(_) => report.imported += 1,
                Err(CalibrationError::CatalogIntegrity(reason)) => {
                    debug!(path = ?path, reason = %reason, "Skipping duplicate");
                    report.duplicates.push(ItemOutcome::skipped(item, reason));
                }
                Err(err @ CalibrationError::Validation(_)) => {
                    warn!(path = ?path, error = %err, "Skipping frame with incomplete header");
                    report.invalid.push(ItemOutcome::failed(item, &err));
                }
                Err(err) => {
                    warn!(path = ?path, error = %err, "Failed to import frame");
                    report.failures.push(ItemOutcome::failed(item, &err));
                }
            }
        }
        info!(
            root = ?root,
            scanned = report.scanned,
            imported = report.imported,
            duplicates = report.duplicates.len(),
            invalid = report.invalid.len(),
            "Import finished"
        );
        Ok(report)
    }

    /// Catalogue one file
    pub fn import_file(&self, path: &Path) -> Result<Frame, CalibrationError> {
        if self.catalog.frame_by_path(path)?.is_some() {
            return Err(CalibrationError::CatalogIntegrity(format!(
                "path {:?} is already catalogued",
                path
            )));
        }
        let fields = self.metadata.read_header(path)?;
        let (kind, acquisition) = Acquisition::from_fields(path, &fields)?;
        let hash = self.metadata.content_hash(path)?;
        let frame = Frame::new(hash, path.to_path_buf(), kind, acquisition);
        self.catalog.insert_frame(&frame)?;
        Ok(frame)
    }

    /// Exposure files under `root`, sorted by path
    fn exposures(&self, root: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let walker = WalkDir::new(root)
            .follow_links(self.options.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.skipped_dir(e));

        let mut out = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| {
                StorageError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("Failed to walk {:?}: {}", root, e),
                ))
            })?;
            if entry.file_type().is_file() && self.is_exposure(entry.path()) {
                out.push(entry.into_path());
            }
        }
        Ok(out)
    }

    fn skipped_dir(&self, entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && self
                .options
                .skip_dirs
                .iter()
                .any(|d| entry.file_name().to_string_lossy() == d.as_str())
    }

    fn is_exposure(&self, path: &Path) -> bool {
        if SidecarMetadata::is_sidecar(path) {
            return false;
        }
        path.extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .map(|e| self.options.extensions.iter().any(|x| *x == e))
            .unwrap_or(false)
    }
}
