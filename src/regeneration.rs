//! Session Regeneration
//!
//! Rebuilds the session partition and every light session's calibration links from the
//! frame catalog. The new state is computed entirely in memory, where cancellation is
//! honoured, and then committed in one transaction; a cancelled or failed run leaves the
//! previous sessions and links exactly as they were.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::info;

use crate::catalog::{Catalog, Grouping};
use crate::error::CalibrationError;
use crate::progress::{CancellationToken, ProgressSink, ProgressUpdate};
use crate::resolver::{CandidatePool, Resolver};
use crate::session::SessionGrouper;
use crate::types::Hash;

const STEPS: usize = 3;

/// Outcome of a regeneration request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegenerationReport {
    /// Nothing to do: sessions exist and every frame is grouped
    pub skipped: bool,
    pub light_sessions: usize,
    pub calibration_sessions: usize,
    pub links: usize,
    pub incomplete_links: usize,
    /// Masters whose source session reappeared in the new grouping
    pub masters_reattached: usize,
}

pub struct Regenerator<'a> {
    catalog: &'a Catalog,
    grouper: &'a SessionGrouper,
    resolver: &'a Resolver,
}

impl<'a> Regenerator<'a> {
    pub fn new(catalog: &'a Catalog, grouper: &'a SessionGrouper, resolver: &'a Resolver) -> Self {
        Self {
            catalog,
            grouper,
            resolver,
        }
    }

    /// Compute the full grouping and links without touching the catalog
    pub fn plan(
        &self,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<Grouping, CalibrationError> {
        let frames = self.catalog.list_frames()?;
        checkpoint(cancel)?;

        progress.report(ProgressUpdate::new(1, STEPS, format!("Grouping {} frames", frames.len())));
        let lights = self.grouper.group_lights(&frames);
        checkpoint(cancel)?;
        let mut calibrations = self.grouper.group_calibrations(&frames);
        checkpoint(cancel)?;

        let masters = self.catalog.list_masters()?;
        let by_source: BTreeMap<Hash, Hash> = masters
            .iter()
            .map(|m| (m.source_session, m.hash))
            .collect();
        for session in &mut calibrations {
            session.master = by_source.get(&session.id).copied();
        }

        let active: HashSet<Hash> = frames.iter().filter(|f| f.is_active()).map(|f| f.hash).collect();
        let pool = CandidatePool::build(
            &calibrations,
            |s| s.frames.iter().filter(|h| active.contains(*h)).count(),
            &masters,
        );

        progress.report(ProgressUpdate::new(
            2,
            STEPS,
            format!("Resolving {} light sessions", lights.len()),
        ));
        let mut links = BTreeMap::new();
        for light in &lights {
            checkpoint(cancel)?;
            links.insert(light.id, self.resolver.resolve(light, &pool));
        }

        Ok(Grouping {
            lights,
            calibrations,
            links,
        })
    }

    /// Regroup and relink. Without `force`, a catalog whose frames are all grouped is left alone.
    pub fn regenerate(
        &self,
        force: bool,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<RegenerationReport, CalibrationError> {
        checkpoint(cancel)?;
        if !force && self.catalog.session_count() > 0 && self.catalog.ungrouped_frames()? == 0 {
            info!("Sessions are current; skipping regeneration");
            return Ok(RegenerationReport {
                skipped: true,
                ..RegenerationReport::default()
            });
        }

        let grouping = self.plan(cancel, progress)?;
        checkpoint(cancel)?;

        progress.report(ProgressUpdate::new(3, STEPS, "Committing sessions"));
        self.catalog.replace_grouping(&grouping)?;

        let report = RegenerationReport {
            skipped: false,
            light_sessions: grouping.lights.len(),
            calibration_sessions: grouping.calibrations.len(),
            links: grouping.links.len(),
            incomplete_links: grouping.links.values().filter(|r| !r.is_complete()).count(),
            masters_reattached: grouping
                .calibrations
                .iter()
                .filter(|s| s.master.is_some())
                .count(),
        };
        info!(
            light_sessions = report.light_sessions,
            calibration_sessions = report.calibration_sessions,
            incomplete = report.incomplete_links,
            "Regenerated sessions"
        );
        Ok(report)
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), CalibrationError> {
    if cancel.is_cancelled() {
        Err(CalibrationError::Cancelled)
    } else {
        Ok(())
    }
}
