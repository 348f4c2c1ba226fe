//! Calibration Resolver
//!
//! Matches a light session against calibration sessions and masters. Each calibration kind
//! is resolved independently:
//!
//! 1. equipment signature must match exactly (all kinds)
//! 2. sensor temperature within tolerance (darks only; bias ignores temperature)
//! 3. exposure must match exactly (darks only, one dark per exposure in the session)
//! 4. filter must match exactly (flats only)
//! 5. nearest observation date on or before the light, else nearest after; then more
//!    frames, then higher quality
//! 6. a master beats a raw session on a complete tie
//!
//! Resolution is a pure function of the candidate pool. A kind with no match is a gap in
//! the returned `Resolution`, never an error.

use crate::header::FrameKind;
use crate::master::Master;
use crate::session::{
    exposure_label, filter_key, CalibrationSession, EquipmentSignature, LightSession,
};
use crate::types::{short_hex, Hash, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

pub const DEFAULT_DARK_TEMPERATURE_TOLERANCE_C: f64 = 5.0;

/// Absorbs binary float error so a delta of exactly the tolerance is accepted
const TEMPERATURE_EPSILON: f64 = 1e-9;

/// A resolved calibration source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CalibrationRef {
    Master(Hash),
    Session(SessionId),
}

impl CalibrationRef {
    pub fn is_master(&self) -> bool {
        matches!(self, CalibrationRef::Master(_))
    }

    pub fn master_hash(&self) -> Option<Hash> {
        match self {
            CalibrationRef::Master(h) => Some(*h),
            CalibrationRef::Session(_) => None,
        }
    }
}

impl fmt::Display for CalibrationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationRef::Master(h) => write!(f, "master:{}", short_hex(h)),
            CalibrationRef::Session(id) => write!(f, "session:{}", short_hex(id)),
        }
    }
}

/// Calibration sources resolved for one light session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub bias: Option<CalibrationRef>,
    /// Keyed by exposure in milliseconds
    pub darks: BTreeMap<u64, Option<CalibrationRef>>,
    /// Keyed by filter name; the empty key is unfiltered
    pub flats: BTreeMap<String, Option<CalibrationRef>>,
}

impl Resolution {
    /// Every kind (and every exposure and filter in use) resolved
    pub fn is_complete(&self) -> bool {
        self.bias.is_some()
            && !self.darks.is_empty()
            && self.darks.values().all(Option::is_some)
            && self.flats.values().all(Option::is_some)
    }

    pub fn is_empty(&self) -> bool {
        self.bias.is_none()
            && self.darks.values().all(Option::is_none)
            && self.flats.values().all(Option::is_none)
    }

    /// Labels of unresolved kinds, e.g. `dark[300s]`, `flat[Ha]`
    pub fn gaps(&self) -> Vec<String> {
        let mut gaps = Vec::new();
        if self.bias.is_none() {
            gaps.push("bias".to_string());
        }
        if self.darks.is_empty() {
            gaps.push("dark".to_string());
        }
        for (exposure, dark) in &self.darks {
            if dark.is_none() {
                gaps.push(format!("dark[{}]", exposure_label(*exposure)));
            }
        }
        for (filter, flat) in &self.flats {
            if flat.is_none() {
                gaps.push(format!("flat[{}]", filter));
            }
        }
        gaps
    }

    pub fn dark_for(&self, exposure_ms: u64) -> Option<CalibrationRef> {
        self.darks.get(&exposure_ms).copied().flatten()
    }

    pub fn flat_for(&self, filter: &Option<String>) -> Option<CalibrationRef> {
        self.flats.get(&filter_key(filter)).copied().flatten()
    }

    /// Every reference in the resolution
    pub fn references(&self) -> Vec<CalibrationRef> {
        let mut refs: Vec<CalibrationRef> = self.bias.iter().copied().collect();
        refs.extend(self.darks.values().flatten().copied());
        refs.extend(self.flats.values().flatten().copied());
        refs
    }
}

/// One matchable calibration source, raw session or master
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationCandidate {
    pub reference: CalibrationRef,
    pub kind: FrameKind,
    pub equipment: EquipmentSignature,
    pub exposure_ms: u64,
    pub filter: Option<String>,
    pub temperature_c: Option<f64>,
    pub observed_at: DateTime<Utc>,
    pub frame_count: usize,
    pub quality: Option<u8>,
}

/// Calibration candidates bucketed by kind and equipment signature
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    buckets: BTreeMap<(FrameKind, EquipmentSignature), Vec<CalibrationCandidate>>,
}

impl CandidatePool {
    /// Build from calibration sessions and masters.
    ///
    /// A session that already has a master is represented by that master; a session with
    /// no active frames is not a candidate.
    pub fn build<F>(sessions: &[CalibrationSession], active_frames: F, masters: &[Master]) -> Self
    where
        F: Fn(&CalibrationSession) -> usize,
    {
        let mut pool = CandidatePool::default();
        for session in sessions {
            if session.master.is_some() {
                continue;
            }
            let count = active_frames(session);
            if count == 0 {
                continue;
            }
            pool.push(CalibrationCandidate {
                reference: CalibrationRef::Session(session.id),
                kind: session.kind,
                equipment: session.equipment.clone(),
                exposure_ms: session.exposure_ms,
                filter: session.filter.clone(),
                temperature_c: session.temperature_c,
                observed_at: session.observed_at,
                frame_count: count,
                quality: None,
            });
        }
        for master in masters {
            pool.push(CalibrationCandidate {
                reference: CalibrationRef::Master(master.hash),
                kind: master.kind,
                equipment: master.equipment.clone(),
                exposure_ms: master.exposure_ms,
                filter: master.filter.clone(),
                temperature_c: master.temperature_c,
                observed_at: master.observed_at,
                frame_count: master.frame_count,
                quality: master.quality,
            });
        }
        pool
    }

    pub fn push(&mut self, candidate: CalibrationCandidate) {
        self.buckets
            .entry((candidate.kind, candidate.equipment.clone()))
            .or_default()
            .push(candidate);
    }

    /// Candidates of `kind` whose equipment matches exactly (tier 1)
    pub fn candidates(&self, kind: FrameKind, equipment: &EquipmentSignature) -> &[CalibrationCandidate] {
        self.buckets
            .get(&(kind, equipment.clone()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tiered calibration matcher
#[derive(Debug, Clone)]
pub struct Resolver {
    dark_temperature_tolerance_c: f64,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(DEFAULT_DARK_TEMPERATURE_TOLERANCE_C)
    }
}

impl Resolver {
    pub fn new(dark_temperature_tolerance_c: f64) -> Self {
        Self {
            dark_temperature_tolerance_c,
        }
    }

    pub fn tolerance(&self) -> f64 {
        self.dark_temperature_tolerance_c
    }

    pub fn resolve(&self, light: &LightSession, pool: &CandidatePool) -> Resolution {
        let bias = self.pick(light, pool.candidates(FrameKind::Bias, &light.equipment).iter());

        let mut darks = BTreeMap::new();
        for &exposure in &light.exposures {
            let dark = self.pick(
                light,
                pool.candidates(FrameKind::Dark, &light.equipment)
                    .iter()
                    .filter(|c| self.temperature_within(light.temperature_c, c.temperature_c))
                    .filter(|c| c.exposure_ms == exposure),
            );
            darks.insert(exposure, dark);
        }

        let mut flats = BTreeMap::new();
        for filter in &light.filters {
            let flat = self.pick(
                light,
                pool.candidates(FrameKind::Flat, &light.equipment)
                    .iter()
                    .filter(|c| &c.filter == filter),
            );
            flats.insert(filter_key(filter), flat);
        }

        let resolution = Resolution { bias, darks, flats };
        debug!(
            session = %short_hex(&light.id),
            complete = resolution.is_complete(),
            gaps = ?resolution.gaps(),
            "resolved light session"
        );
        resolution
    }

    /// Dark temperature tier. Two absent readings match; one absent reading does not.
    pub fn temperature_within(&self, light: Option<f64>, candidate: Option<f64>) -> bool {
        match (light, candidate) {
            (Some(a), Some(b)) => {
                (a - b).abs() <= self.dark_temperature_tolerance_c + TEMPERATURE_EPSILON
            }
            (None, None) => true,
            _ => false,
        }
    }

    fn pick<'a>(
        &self,
        light: &LightSession,
        candidates: impl Iterator<Item = &'a CalibrationCandidate>,
    ) -> Option<CalibrationRef> {
        let light_date = light.observed_at.date_naive();
        candidates
            .min_by_key(|c| {
                let days = (c.observed_at.date_naive() - light_date).num_days();
                (
                    days > 0,
                    days.abs(),
                    Reverse(c.frame_count),
                    Reverse(c.quality),
                    !c.reference.is_master(),
                    c.reference,
                )
            })
            .map(|c| c.reference)
    }
}
