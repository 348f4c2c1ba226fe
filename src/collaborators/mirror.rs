//! Mirror cloud storage
//!
//! Content-addressed object store on a mounted filesystem (NAS, synced drive, bucket mount).
//! Objects live at `{root}/objects/{hex[0..2]}/{hex[2..4]}/{hex}.fits` and are addressed by
//! `mirror://{hex}` URLs. `exists` re-hashes the stored object, so a truncated or corrupted
//! copy never verifies.

use crate::collaborators::{hash_file, CloudStorage};
use crate::error::{CalibrationError, StorageError};
use crate::types::{parse_hex, to_hex, Hash};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};

const URL_SCHEME: &str = "mirror://";
const TOOL: &str = "mirror storage";

#[derive(Debug, Clone)]
pub struct MirrorStorage {
    root: PathBuf,
}

impl MirrorStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        let objects = root.join("objects");
        fs::create_dir_all(&objects).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to create object directory at {:?}: {}", objects, e),
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, hash: &Hash) -> PathBuf {
        let hex = to_hex(hash);
        self.root
            .join("objects")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(format!("{}.fits", hex))
    }

    pub fn url_for(hash: &Hash) -> String {
        format!("{}{}", URL_SCHEME, to_hex(hash))
    }

    fn hash_from_url(url: &str) -> Result<Hash, CalibrationError> {
        let hex = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| CalibrationError::external(TOOL, format!("not a mirror URL: {}", url)))?;
        Ok(parse_hex(hex)?)
    }
}

fn verify_object(path: &Path, hash: &Hash) -> Result<bool, StorageError> {
    if !path.exists() {
        return Ok(false);
    }
    Ok(&hash_file(path)? == hash)
}

fn copy_atomic(source: &Path, dest: &Path) -> Result<(), StorageError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = dest.with_extension("tmp");
    fs::copy(source, &temp)?;
    fs::rename(&temp, dest).map_err(|e| {
        let _ = fs::remove_file(&temp);
        StorageError::from(e)
    })
}

async fn blocking<T, F>(work: F) -> Result<T, CalibrationError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| CalibrationError::external(TOOL, e.to_string()))?
        .map_err(CalibrationError::from)
}

#[async_trait]
impl CloudStorage for MirrorStorage {
    async fn exists(&self, hash: &Hash) -> Result<bool, CalibrationError> {
        let path = self.object_path(hash);
        let hash = *hash;
        blocking(move || verify_object(&path, &hash)).await
    }

    async fn upload(&self, path: &Path, hash: &Hash) -> Result<String, CalibrationError> {
        let dest = self.object_path(hash);
        let source = path.to_path_buf();
        let expected = *hash;
        blocking(move || {
            if verify_object(&dest, &expected)? {
                return Ok(());
            }
            copy_atomic(&source, &dest)
        })
        .await?;
        Ok(Self::url_for(hash))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), CalibrationError> {
        let hash = Self::hash_from_url(url)?;
        let source = self.object_path(&hash);
        if !source.exists() {
            return Err(CalibrationError::NotFound(format!("object {}", url)));
        }
        let dest = dest.to_path_buf();
        blocking(move || copy_atomic(&source, &dest)).await
    }
}
