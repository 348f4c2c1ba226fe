//! Session Grouper
//!
//! Partitions catalogued frames into light and calibration sessions. Grouping is a pure
//! function of the frame set: frames are bucketed by key, ordered by observation time,
//! and split into observing nights. Session ids are digests of the key and night anchor,
//! so regrouping unchanged frames reproduces the same ids.

use crate::catalog::Frame;
use crate::header::FrameKind;
use crate::session::{CalibrationSession, EquipmentSignature, LightSession};
use crate::types::SessionId;
use blake3::Hasher;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// Default "same observing night" window
pub const DEFAULT_NIGHT_WINDOW_HOURS: f64 = 16.0;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct LightKey {
    object: Option<String>,
    equipment: EquipmentSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CalibrationKey {
    kind: FrameKind,
    equipment: EquipmentSignature,
    /// Darks only
    exposure_ms: Option<u64>,
    /// Flats only
    filter: Option<Option<String>>,
}

/// Groups frames into sessions
#[derive(Debug, Clone)]
pub struct SessionGrouper {
    night_window: Duration,
}

impl Default for SessionGrouper {
    fn default() -> Self {
        Self::with_window_hours(DEFAULT_NIGHT_WINDOW_HOURS)
    }
}

impl SessionGrouper {
    pub fn new(night_window: Duration) -> Self {
        Self { night_window }
    }

    pub fn with_window_hours(hours: f64) -> Self {
        Self::new(Duration::milliseconds((hours * 3_600_000.0).round() as i64))
    }

    pub fn night_window(&self) -> Duration {
        self.night_window
    }

    /// Group light frames by object, equipment signature and observing night.
    pub fn group_lights(&self, frames: &[Frame]) -> Vec<LightSession> {
        let mut buckets: BTreeMap<LightKey, Vec<&Frame>> = BTreeMap::new();
        for frame in frames.iter().filter(|f| f.kind == FrameKind::Light) {
            buckets
                .entry(LightKey {
                    object: frame.acquisition.object.clone(),
                    equipment: frame.acquisition.equipment(),
                })
                .or_default()
                .push(frame);
        }

        let mut sessions = Vec::new();
        for (key, members) in buckets {
            for night in self.split_nights(members) {
                let anchor = night[0].acquisition.observed_at;
                let mut filters: Vec<Option<String>> =
                    night.iter().map(|f| f.acquisition.filter.clone()).collect();
                filters.sort();
                filters.dedup();
                let mut exposures: Vec<u64> =
                    night.iter().map(|f| f.acquisition.exposure_ms()).collect();
                exposures.sort_unstable();
                exposures.dedup();

                let id = session_id(
                    b"light",
                    &[
                        opt_part(key.object.as_deref()),
                        key.equipment.telescope.clone(),
                        key.equipment.instrument.clone(),
                        key.equipment.binning.to_string(),
                        opt_part(key.equipment.gain.map(|g| g.to_string()).as_deref()),
                        opt_part(key.equipment.offset.map(|o| o.to_string()).as_deref()),
                    ],
                    anchor,
                );
                sessions.push(LightSession {
                    id,
                    object: key.object.clone(),
                    equipment: key.equipment.clone(),
                    filters,
                    exposure_ms: mode(night.iter().map(|f| f.acquisition.exposure_ms()))
                        .unwrap_or_default(),
                    exposures,
                    temperature_c: mean_temperature(&night),
                    observed_at: anchor,
                    frames: night.iter().map(|f| f.hash).collect(),
                });
            }
        }
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(sessions = sessions.len(), "grouped light frames");
        sessions
    }

    /// Group calibration frames by kind and equipment signature (plus exposure for darks
    /// and filter for flats) and observing night.
    pub fn group_calibrations(&self, frames: &[Frame]) -> Vec<CalibrationSession> {
        let mut buckets: BTreeMap<CalibrationKey, Vec<&Frame>> = BTreeMap::new();
        for frame in frames.iter().filter(|f| f.kind.is_calibration()) {
            let acq = &frame.acquisition;
            let key = CalibrationKey {
                kind: frame.kind,
                equipment: acq.equipment(),
                exposure_ms: (frame.kind == FrameKind::Dark).then(|| acq.exposure_ms()),
                filter: (frame.kind == FrameKind::Flat).then(|| acq.filter.clone()),
            };
            buckets.entry(key).or_default().push(frame);
        }

        let mut sessions = Vec::new();
        for (key, members) in buckets {
            for night in self.split_nights(members) {
                let anchor = night[0].acquisition.observed_at;
                let exposure_ms = key.exposure_ms.unwrap_or_else(|| {
                    mode(night.iter().map(|f| f.acquisition.exposure_ms())).unwrap_or_default()
                });
                let filter = key.filter.clone().flatten();
                let id = session_id(
                    b"calibration",
                    &[
                        key.kind.as_str().to_string(),
                        key.equipment.telescope.clone(),
                        key.equipment.instrument.clone(),
                        key.equipment.binning.to_string(),
                        opt_part(key.equipment.gain.map(|g| g.to_string()).as_deref()),
                        opt_part(key.equipment.offset.map(|o| o.to_string()).as_deref()),
                        opt_part(key.exposure_ms.map(|e| e.to_string()).as_deref()),
                        opt_part(filter.as_deref()),
                    ],
                    anchor,
                );
                sessions.push(CalibrationSession {
                    id,
                    kind: key.kind,
                    equipment: key.equipment.clone(),
                    exposure_ms,
                    filter,
                    temperature_c: mean_temperature(&night),
                    observed_at: anchor,
                    frames: night.iter().map(|f| f.hash).collect(),
                    master: None,
                });
            }
        }
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(sessions = sessions.len(), "grouped calibration frames");
        sessions
    }

    /// Split time-ordered members into nights. A night opens at its first frame and admits
    /// every later frame within the window of that anchor.
    fn split_nights<'a>(&self, mut members: Vec<&'a Frame>) -> Vec<Vec<&'a Frame>> {
        members.sort_by(|a, b| {
            a.acquisition
                .observed_at
                .cmp(&b.acquisition.observed_at)
                .then_with(|| a.hash.cmp(&b.hash))
        });

        let mut nights: Vec<Vec<&Frame>> = Vec::new();
        let mut anchor: Option<DateTime<Utc>> = None;
        for frame in members {
            let at = frame.acquisition.observed_at;
            match anchor {
                Some(start) if at - start <= self.night_window => {
                    if let Some(current) = nights.last_mut() {
                        current.push(frame);
                    }
                }
                _ => {
                    anchor = Some(at);
                    nights.push(vec![frame]);
                }
            }
        }
        nights
    }
}

/// Most frequent value; ties go to the smallest
fn mode<T: Ord + Clone>(values: impl Iterator<Item = T>) -> Option<T> {
    let mut counts: BTreeMap<T, usize> = BTreeMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    let mut best: Option<(T, usize)> = None;
    for (value, count) in counts {
        match &best {
            Some((_, n)) if *n >= count => {}
            _ => best = Some((value, count)),
        }
    }
    best.map(|(v, _)| v)
}

fn mean_temperature(frames: &[&Frame]) -> Option<f64> {
    let temps: Vec<f64> = frames
        .iter()
        .filter_map(|f| f.acquisition.temperature_c)
        .collect();
    if temps.is_empty() {
        return None;
    }
    let mean = temps.iter().sum::<f64>() / temps.len() as f64;
    Some((mean * 100.0).round() / 100.0)
}

fn opt_part(value: Option<&str>) -> String {
    match value {
        Some(v) => format!("some:{v}"),
        None => "none".to_string(),
    }
}

/// SessionId = hash(discriminator || (len || part)* || anchor_millis)
fn session_id(discriminator: &[u8], parts: &[String], anchor: DateTime<Utc>) -> SessionId {
    let mut hasher = Hasher::new();
    hasher.update(discriminator);
    for part in parts {
        hasher.update(&(part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.update(&anchor.timestamp_millis().to_be_bytes());
    *hasher.finalize().as_bytes()
}
