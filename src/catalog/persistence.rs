//! Sled-backed frame catalog.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use tracing::debug;

use crate::catalog::{
    CalibrationProvenance, CalibrationStatus, CloudLocation, Frame, LifecycleState, MasterRef,
};
use crate::error::{CalibrationError, StorageError, ValidationError};
use crate::header::FrameKind;
use crate::master::Master;
use crate::resolver::Resolution;
use crate::session::{CalibrationSession, LightSession, Session};
use crate::types::{short_hex, FrameHash, Hash, SessionId};

const TREE_FRAMES: &str = "frames";
const TREE_FRAME_PATHS: &str = "frame_paths";
const TREE_SESSIONS: &str = "sessions";
const TREE_LINKS: &str = "links";
const TREE_MASTERS: &str = "masters";

type TxError = ConflictableTransactionError<CalibrationError>;

/// A complete session partition with its resolved links, committed as one unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grouping {
    pub lights: Vec<LightSession>,
    pub calibrations: Vec<CalibrationSession>,
    pub links: BTreeMap<SessionId, Resolution>,
}

impl Grouping {
    pub fn session_count(&self) -> usize {
        self.lights.len() + self.calibrations.len()
    }

    /// Frame hash to owning session id
    pub fn assignments(&self) -> BTreeMap<FrameHash, SessionId> {
        let lights = self.lights.iter().map(|s| (s.id, &s.frames));
        let calibrations = self.calibrations.iter().map(|s| (s.id, &s.frames));
        lights
            .chain(calibrations)
            .flat_map(|(id, frames)| frames.iter().map(move |hash| (*hash, id)))
            .collect()
    }
}

/// Durable catalog of frames, sessions, links and masters
pub struct Catalog {
    db: Db,
    frames: Tree,
    frame_paths: Tree,
    sessions: Tree,
    links: Tree,
    masters: Tree,
    generation: AtomicU64,
}

impl Catalog {
    /// Open (or create) a catalog database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            StorageError::Database(format!(
                "Failed to open catalog at {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Self::from_db(db)
    }

    pub fn from_db(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            frames: db.open_tree(TREE_FRAMES).map_err(to_storage_db)?,
            frame_paths: db.open_tree(TREE_FRAME_PATHS).map_err(to_storage_db)?,
            sessions: db.open_tree(TREE_SESSIONS).map_err(to_storage_db)?,
            links: db.open_tree(TREE_LINKS).map_err(to_storage_db)?,
            masters: db.open_tree(TREE_MASTERS).map_err(to_storage_db)?,
            db,
            generation: AtomicU64::new(0),
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Monotonic counter bumped on every committed write
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn committed(&self) -> Result<(), StorageError> {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.db.flush().map_err(to_storage_db)?;
        Ok(())
    }

    // ----- frames -----

    /// Insert a newly imported frame. A duplicate content hash or path is an integrity error.
    pub fn insert_frame(&self, frame: &Frame) -> Result<(), CalibrationError> {
        let value = encode(frame)?;
        let path_key = path_key(&frame.path);
        let result = (&self.frames, &self.frame_paths).transaction(|(frames, paths)| {
            if frames.get(&frame.hash[..])?.is_some() {
                return Err(aborted(CalibrationError::CatalogIntegrity(format!(
                    "duplicate content hash {} for {:?}",
                    short_hex(&frame.hash),
                    frame.path
                ))));
            }
            if paths.get(path_key.as_bytes())?.is_some() {
                return Err(aborted(CalibrationError::CatalogIntegrity(format!(
                    "path {:?} is already catalogued",
                    frame.path
                ))));
            }
            frames.insert(&frame.hash[..], value.clone())?;
            paths.insert(path_key.as_bytes(), &frame.hash[..])?;
            Ok(())
        });
        finish(result)?;
        self.committed()?;
        Ok(())
    }

    pub fn get_frame(&self, hash: &FrameHash) -> Result<Option<Frame>, StorageError> {
        let Some(raw) = self.frames.get(&hash[..]).map_err(to_storage_db)? else {
            return Ok(None);
        };
        Ok(Some(decode(&raw)?))
    }

    pub fn frame_by_path(&self, path: &Path) -> Result<Option<Frame>, StorageError> {
        let Some(raw) = self
            .frame_paths
            .get(path_key(path).as_bytes())
            .map_err(to_storage_db)?
        else {
            return Ok(None);
        };
        let hash = <Hash>::try_from(&raw[..])
            .map_err(|_| StorageError::InvalidId(format!("corrupt path index for {:?}", path)))?;
        self.get_frame(&hash)
    }

    pub fn list_frames(&self) -> Result<Vec<Frame>, StorageError> {
        self.frames
            .iter()
            .values()
            .map(|raw| decode(&raw.map_err(to_storage_db)?))
            .collect()
    }

    /// Frames for the given hashes, in order. A missing hash is an orphaned reference.
    pub fn frames_for(&self, hashes: &[FrameHash]) -> Result<Vec<Frame>, CalibrationError> {
        hashes
            .iter()
            .map(|hash| {
                self.get_frame(hash)?.ok_or_else(|| {
                    CalibrationError::CatalogIntegrity(format!(
                        "session references unknown frame {}",
                        short_hex(hash)
                    ))
                })
            })
            .collect()
    }

    // ----- sessions and links -----

    pub fn list_sessions(&self) -> Result<Vec<Session>, StorageError> {
        self.sessions
            .iter()
            .values()
            .map(|raw| decode(&raw.map_err(to_storage_db)?))
            .collect()
    }

    pub fn light_sessions(&self) -> Result<Vec<LightSession>, StorageError> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .filter_map(|s| match s {
                Session::Light(light) => Some(light),
                Session::Calibration(_) => None,
            })
            .collect())
    }

    pub fn calibration_sessions(&self) -> Result<Vec<CalibrationSession>, StorageError> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .filter_map(|s| match s {
                Session::Calibration(cal) => Some(cal),
                Session::Light(_) => None,
            })
            .collect())
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StorageError> {
        let Some(raw) = self.sessions.get(&id[..]).map_err(to_storage_db)? else {
            return Ok(None);
        };
        Ok(Some(decode(&raw)?))
    }

    pub fn get_links(&self, id: &SessionId) -> Result<Option<Resolution>, StorageError> {
        let Some(raw) = self.links.get(&id[..]).map_err(to_storage_db)? else {
            return Ok(None);
        };
        Ok(Some(decode(&raw)?))
    }

    pub fn list_links(&self) -> Result<Vec<(SessionId, Resolution)>, StorageError> {
        self.links
            .iter()
            .map(|item| {
                let (key, raw) = item.map_err(to_storage_db)?;
                let id = <SessionId>::try_from(&key[..])
                    .map_err(|_| StorageError::InvalidId("corrupt link key".to_string()))?;
                Ok((id, decode(&raw)?))
            })
            .collect()
    }

    /// Upsert links for the given light sessions in one transaction
    pub fn store_links(&self, links: &BTreeMap<SessionId, Resolution>) -> Result<(), CalibrationError> {
        let encoded = links
            .iter()
            .map(|(id, resolution)| Ok((*id, encode(resolution)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;
        let result = (&self.sessions, &self.links).transaction(|(sessions, tx_links)| {
            for (id, value) in &encoded {
                if sessions.get(&id[..])?.is_none() {
                    return Err(aborted(CalibrationError::CatalogIntegrity(format!(
                        "link for unknown session {}",
                        short_hex(id)
                    ))));
                }
                tx_links.insert(&id[..], value.clone())?;
            }
            Ok(())
        });
        finish(result)?;
        self.committed()?;
        Ok(())
    }

    /// Replace every session and link record and reassign frame session ids, atomically.
    ///
    /// Masters are reattached to calibration sessions whose id matches their source session.
    pub fn replace_grouping(&self, grouping: &Grouping) -> Result<(), CalibrationError> {
        let old_sessions = keys(&self.sessions)?;
        let old_links = keys(&self.links)?;
        let frame_keys = keys(&self.frames)?;
        let assignments = grouping.assignments();

        let masters_by_source: BTreeMap<SessionId, Hash> = self
            .list_masters()?
            .into_iter()
            .map(|m| (m.source_session, m.hash))
            .collect();

        let mut new_sessions = Vec::with_capacity(grouping.session_count());
        for light in &grouping.lights {
            new_sessions.push((light.id, encode(&Session::Light(light.clone()))?));
        }
        for cal in &grouping.calibrations {
            let mut cal = cal.clone();
            cal.master = masters_by_source.get(&cal.id).copied();
            new_sessions.push((cal.id, encode(&Session::Calibration(cal))?));
        }
        let new_links = grouping
            .links
            .iter()
            .map(|(id, resolution)| Ok((*id, encode(resolution)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;

        let result = (&self.frames, &self.sessions, &self.links).transaction(
            |(frames, sessions, links)| {
                for key in &old_sessions {
                    sessions.remove(key.as_slice())?;
                }
                for key in &old_links {
                    links.remove(key.as_slice())?;
                }
                for key in &frame_keys {
                    let Some(raw) = frames.get(key.as_slice())? else {
                        continue;
                    };
                    let mut frame: Frame = decode(&raw).map_err(aborted)?;
                    let assigned = assignments.get(&frame.hash).copied();
                    if frame.session_id != assigned {
                        frame.session_id = assigned;
                        frames.insert(key.as_slice(), encode(&frame).map_err(aborted)?)?;
                    }
                }
                for (id, value) in &new_sessions {
                    sessions.insert(&id[..], value.clone())?;
                }
                for (id, value) in &new_links {
                    links.insert(&id[..], value.clone())?;
                }
                Ok(())
            },
        );
        finish(result)?;
        self.committed()?;
        debug!(
            sessions = grouping.session_count(),
            links = grouping.links.len(),
            "Replaced session grouping"
        );
        Ok(())
    }

    // ----- masters -----

    pub fn list_masters(&self) -> Result<Vec<Master>, StorageError> {
        self.masters
            .iter()
            .values()
            .map(|raw| decode(&raw.map_err(to_storage_db)?))
            .collect()
    }

    pub fn get_master(&self, hash: &Hash) -> Result<Option<Master>, StorageError> {
        let Some(raw) = self.masters.get(&hash[..]).map_err(to_storage_db)? else {
            return Ok(None);
        };
        Ok(Some(decode(&raw)?))
    }

    /// Record a master, point its session at it and soft-delete every source frame.
    ///
    /// `replaces` names the session's previous master when rebuilding with force; without
    /// it an existing master aborts the commit.
    pub fn commit_master(
        &self,
        master: &Master,
        sources: &[FrameHash],
        replaces: Option<Hash>,
    ) -> Result<(), CalibrationError> {
        let master_value = encode(master)?;
        let consumed = MasterRef {
            hash: master.hash,
            path: master.path.clone(),
        };
        let session_key = master.source_session;

        let result = (&self.frames, &self.sessions, &self.masters).transaction(
            |(frames, sessions, masters)| {
                let Some(raw) = sessions.get(&session_key[..])? else {
                    return Err(aborted(CalibrationError::NotFound(format!(
                        "session {}",
                        short_hex(&session_key)
                    ))));
                };
                let mut session = match decode::<Session>(&raw).map_err(aborted)? {
                    Session::Calibration(cal) => cal,
                    Session::Light(_) => {
                        return Err(aborted(ValidationError::UnsupportedKind(
                            FrameKind::Light.as_str().to_string(),
                        )))
                    }
                };
                if let Some(existing) = session.master {
                    if replaces != Some(existing) {
                        return Err(aborted(ValidationError::MasterExists {
                            session: short_hex(&session_key),
                        }));
                    }
                    if existing != master.hash {
                        masters.remove(&existing[..])?;
                    }
                }
                masters.insert(&master.hash[..], master_value.clone())?;

                session.master = Some(master.hash);
                sessions.insert(
                    &session_key[..],
                    encode(&Session::Calibration(session)).map_err(aborted)?,
                )?;

                for hash in sources {
                    let Some(raw) = frames.get(&hash[..])? else {
                        return Err(aborted(CalibrationError::CatalogIntegrity(format!(
                            "master source {} is not catalogued",
                            short_hex(hash)
                        ))));
                    };
                    let mut frame: Frame = decode(&raw).map_err(aborted)?;
                    if frame.lifecycle == LifecycleState::Active {
                        frame.lifecycle = LifecycleState::SoftDeleted;
                    }
                    frame.consumed_by = Some(consumed.clone());
                    frames.insert(&hash[..], encode(&frame).map_err(aborted)?)?;
                }
                Ok(())
            },
        );
        finish(result)?;
        self.committed()?;
        Ok(())
    }

    // ----- lifecycle -----

    /// `Uncalibrated → Calibrated` with provenance. There is no reverse transition.
    pub fn mark_calibrated(
        &self,
        hash: &FrameHash,
        provenance: &CalibrationProvenance,
    ) -> Result<Frame, CalibrationError> {
        let result = self.frames.transaction(|frames| {
            let Some(raw) = frames.get(&hash[..])? else {
                return Err(aborted(CalibrationError::NotFound(format!(
                    "frame {}",
                    short_hex(hash)
                ))));
            };
            let mut frame: Frame = decode(&raw).map_err(aborted)?;
            if frame.kind != FrameKind::Light {
                return Err(aborted(ValidationError::UnsupportedKind(
                    frame.kind.as_str().to_string(),
                )));
            }
            if frame.calibration == CalibrationStatus::Calibrated {
                return Err(aborted(CalibrationError::CatalogIntegrity(format!(
                    "frame {} is already calibrated",
                    short_hex(hash)
                ))));
            }
            frame.calibration = CalibrationStatus::Calibrated;
            frame.provenance = Some(provenance.clone());
            frames.insert(&hash[..], encode(&frame).map_err(aborted)?)?;
            Ok(frame)
        });
        let frame = finish(result)?;
        self.committed()?;
        Ok(frame)
    }

    /// Move a frame along the retention lifecycle. `cloud` of `None` keeps the recorded location.
    pub fn update_retention(
        &self,
        hash: &FrameHash,
        state: LifecycleState,
        cloud: Option<CloudLocation>,
    ) -> Result<Frame, CalibrationError> {
        let result = self.frames.transaction(|frames| {
            let Some(raw) = frames.get(&hash[..])? else {
                return Err(aborted(CalibrationError::NotFound(format!(
                    "frame {}",
                    short_hex(hash)
                ))));
            };
            let mut frame: Frame = decode(&raw).map_err(aborted)?;
            if state == LifecycleState::Active && frame.lifecycle != LifecycleState::Active {
                return Err(aborted(CalibrationError::CatalogIntegrity(format!(
                    "frame {} cannot return to active from {}",
                    short_hex(hash),
                    frame.lifecycle.as_str()
                ))));
            }
            frame.lifecycle = state;
            if let Some(location) = cloud.clone() {
                frame.cloud = Some(location);
            }
            frames.insert(&hash[..], encode(&frame).map_err(aborted)?)?;
            Ok(frame)
        });
        let frame = finish(result)?;
        self.committed()?;
        Ok(frame)
    }

    /// Raw contents of every catalog tree, for audits and equality checks
    pub fn dump(&self) -> Result<BTreeMap<&'static str, Vec<(Vec<u8>, Vec<u8>)>>, StorageError> {
        let mut out = BTreeMap::new();
        for (name, tree) in [
            (TREE_FRAMES, &self.frames),
            (TREE_FRAME_PATHS, &self.frame_paths),
            (TREE_SESSIONS, &self.sessions),
            (TREE_LINKS, &self.links),
            (TREE_MASTERS, &self.masters),
        ] {
            let entries = tree
                .iter()
                .map(|item| {
                    let (k, v) = item.map_err(to_storage_db)?;
                    Ok((k.to_vec(), v.to_vec()))
                })
                .collect::<Result<Vec<_>, StorageError>>()?;
            out.insert(name, entries);
        }
        Ok(out)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Non-master frames without a session
    pub fn ungrouped_frames(&self) -> Result<usize, StorageError> {
        Ok(self
            .list_frames()?
            .iter()
            .filter(|f| f.session_id.is_none() && f.kind != FrameKind::Master)
            .count())
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn keys(tree: &Tree) -> Result<Vec<Vec<u8>>, StorageError> {
    tree.iter()
        .keys()
        .map(|k| Ok(k.map_err(to_storage_db)?.to_vec()))
        .collect()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(raw).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn aborted(err: impl Into<CalibrationError>) -> TxError {
    ConflictableTransactionError::Abort(err.into())
}

fn finish<T>(result: Result<T, TransactionError<CalibrationError>>) -> Result<T, CalibrationError> {
    result.map_err(|e| match e {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => StorageError::Database(err.to_string()).into(),
    })
}

fn to_storage_db(err: sled::Error) -> StorageError {
    StorageError::Database(err.to_string())
}
