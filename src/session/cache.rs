//! Session index cache
//!
//! Calibration sessions and masters bucketed by kind and equipment signature, tagged with
//! the catalog generation it was built from. A stale generation rebuilds on next use.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::StorageError;
use crate::resolver::CandidatePool;

struct Snapshot {
    generation: u64,
    pool: Arc<CandidatePool>,
}

#[derive(Default)]
pub struct SessionIndex {
    snapshot: RwLock<Option<Snapshot>>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate pool for the catalog's current generation
    pub fn pool(&self, catalog: &Catalog) -> Result<Arc<CandidatePool>, StorageError> {
        let generation = catalog.generation();
        if let Some(snapshot) = self.snapshot.read().as_ref() {
            if snapshot.generation == generation {
                return Ok(Arc::clone(&snapshot.pool));
            }
        }

        let pool = Arc::new(build_pool(catalog)?);
        debug!(generation, candidates = pool.len(), "Rebuilt session index");
        *self.snapshot.write() = Some(Snapshot {
            generation,
            pool: Arc::clone(&pool),
        });
        Ok(pool)
    }

    pub fn invalidate(&self) {
        *self.snapshot.write() = None;
    }

    /// Generation of the cached snapshot, if one is held
    pub fn cached_generation(&self) -> Option<u64> {
        self.snapshot.read().as_ref().map(|s| s.generation)
    }
}

fn build_pool(catalog: &Catalog) -> Result<CandidatePool, StorageError> {
    let active: HashSet<_> = catalog
        .list_frames()?
        .into_iter()
        .filter(|f| f.is_active())
        .map(|f| f.hash)
        .collect();
    let sessions = catalog.calibration_sessions()?;
    let masters = catalog.list_masters()?;
    Ok(CandidatePool::build(
        &sessions,
        |session| session.frames.iter().filter(|h| active.contains(*h)).count(),
        &masters,
    ))
}
