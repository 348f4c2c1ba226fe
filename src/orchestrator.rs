//! Calibration Workflow Orchestrator
//!
//! Runs auto-calibration as one cancellable job of five ordered phases:
//!
//! 1. Analyze: find calibration sessions ready for a master and light sessions lacking
//!    coverage. Read-only.
//! 2. Create Masters: one `create_master` per opportunity, continuing past failures.
//! 3. Resolve Links: resolve every light session in scope against the updated catalog
//!    and persist the links.
//! 4. Calibrate Lights: calibrate each active, uncalibrated light frame with the masters
//!    its session resolved to.
//! 5. Finalize: report.
//!
//! Per-item failures are collected in the summary and never stop sibling work. A catalog
//! integrity failure halts the run; cancellation stops it at the next unit of work.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{CalibrationProvenance, CalibrationStatus, Catalog, Frame, MasterRef};
use crate::collaborators::{CalibrationRequest, Calibrator, FrameMetadata};
use crate::error::{CalibrationError, ErrorClass};
use crate::header::{keys, FieldMap};
use crate::master::{Master, MasterManager, MasterRequest};
use crate::progress::{CancellationToken, ProgressSink, ProgressUpdate};
use crate::resolver::{CalibrationRef, Resolution, Resolver};
use crate::session::{
    exposure_label, filter_key, sanitize, CalibrationSession, LightSession, Session, SessionIndex,
};
use crate::types::{short_hex, to_hex, Hash, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analyze,
    CreateMasters,
    ResolveLinks,
    CalibrateLights,
    Finalize,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Analyze,
        Phase::CreateMasters,
        Phase::ResolveLinks,
        Phase::CalibrateLights,
        Phase::Finalize,
    ];

    /// 1-based position
    pub fn index(self) -> usize {
        match self {
            Phase::Analyze => 1,
            Phase::CreateMasters => 2,
            Phase::ResolveLinks => 3,
            Phase::CalibrateLights => 4,
            Phase::Finalize => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Analyze => "Analyze",
            Phase::CreateMasters => "Create Masters",
            Phase::ResolveLinks => "Resolve Links",
            Phase::CalibrateLights => "Calibrate Lights",
            Phase::Finalize => "Finalize",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Stop after analysis and report what would happen
    pub dry_run: bool,
    /// Restrict work to one light session (and what it resolves to) or one calibration session
    pub session_filter: Option<SessionId>,
}

/// A skipped or failed unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub item: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
}

impl ItemOutcome {
    pub fn skipped(item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            reason: reason.into(),
            class: None,
        }
    }

    pub fn failed(item: impl Into<String>, err: &CalibrationError) -> Self {
        Self {
            item: item.into(),
            reason: err.to_string(),
            class: Some(err.class()),
        }
    }
}

/// Result of one auto-calibration run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub dry_run: bool,
    pub cancelled: bool,
    /// Set when a catalog integrity failure stopped the run
    pub halted: Option<String>,
    /// Calibration sessions ready for a master at analysis time
    pub masters_planned: Vec<String>,
    pub masters_created: Vec<String>,
    pub links_resolved: usize,
    pub resolution_gaps: Vec<ItemOutcome>,
    pub frames_planned: usize,
    pub frames_calibrated: usize,
    /// Calibrated frames missing one or more calibration kinds
    pub partial: Vec<ItemOutcome>,
    pub skipped: Vec<ItemOutcome>,
    pub failures: Vec<ItemOutcome>,
}

impl Summary {
    pub fn error_count(&self) -> usize {
        self.failures.len() + usize::from(self.halted.is_some())
    }
}

/// Control flow after one unit of work
enum Flow {
    Continue,
    Stop,
}

struct Scope {
    lights: Vec<LightSession>,
    calibrations: Vec<CalibrationSession>,
}

pub struct Orchestrator<'a> {
    catalog: &'a Catalog,
    index: &'a SessionIndex,
    resolver: &'a Resolver,
    masters: &'a MasterManager,
    calibrator: &'a dyn Calibrator,
    metadata: &'a dyn FrameMetadata,
    output_root: PathBuf,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        catalog: &'a Catalog,
        index: &'a SessionIndex,
        resolver: &'a Resolver,
        masters: &'a MasterManager,
        calibrator: &'a dyn Calibrator,
        metadata: &'a dyn FrameMetadata,
        output_root: PathBuf,
    ) -> Self {
        Self {
            catalog,
            index,
            resolver,
            masters,
            calibrator,
            metadata,
            output_root,
        }
    }

    pub fn run(
        &self,
        options: &RunOptions,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<Summary, CalibrationError> {
        let mut summary = Summary {
            dry_run: options.dry_run,
            ..Summary::default()
        };
        info!(dry_run = options.dry_run, filter = ?options.session_filter.map(|s| short_hex(&s)), "Starting auto-calibration");

        // Phase 1
        let scope = self.scope(options.session_filter.as_ref())?;
        let opportunities = match self.analyze(&scope, &mut summary, cancel, progress) {
            Ok(opportunities) => opportunities,
            Err(CalibrationError::Cancelled) => return Ok(self.cancelled(summary)),
            Err(err) if err.halts_phase() => {
                self.failure(&mut summary, "analysis".to_string(), err);
                return Ok(summary);
            }
            Err(err) => return Err(err),
        };
        if options.dry_run {
            self.finalize(&summary, progress);
            return Ok(summary);
        }

        // Phase 2
        let phase = Phase::CreateMasters;
        for (i, session) in opportunities.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(summary));
            }
            report(progress, phase, Some(describe_calibration(session)), format!("Master {}/{}", i + 1, opportunities.len()));
            match self.masters.create_master(session, &MasterRequest::default(), cancel) {
                Ok(master) => summary.masters_created.push(to_hex(&master.hash)),
                Err(err) => {
                    if let Flow::Stop = self.failure(&mut summary, describe_calibration(session), err) {
                        return Ok(summary);
                    }
                }
            }
        }

        // Phase 3
        let scope = self.refresh(scope)?;
        let links = match self.resolve_links(&scope, &mut summary, cancel, progress) {
            Ok(links) => links,
            Err(CalibrationError::Cancelled) => return Ok(self.cancelled(summary)),
            Err(err) => {
                if let Flow::Stop = self.failure(&mut summary, "link resolution".to_string(), err) {
                    return Ok(summary);
                }
                BTreeMap::new()
            }
        };

        // Phase 4
        let phase = Phase::CalibrateLights;
        for light in &scope.lights {
            let Some(resolution) = links.get(&light.id) else {
                continue;
            };
            let masters = match self.usable_masters(resolution) {
                Ok(masters) => masters,
                Err(err) => {
                    if let Flow::Stop = self.failure(&mut summary, describe_light(light), err) {
                        return Ok(summary);
                    }
                    continue;
                }
            };
            let frames = match self.catalog.frames_for(&light.frames) {
                Ok(frames) => frames,
                Err(err) => {
                    if let Flow::Stop = self.failure(&mut summary, describe_light(light), err) {
                        return Ok(summary);
                    }
                    continue;
                }
            };
            let pending: Vec<&Frame> = frames.iter().filter(|f| needs_calibration(f)).collect();
            if pending.is_empty() {
                continue;
            }
            if masters.is_empty() {
                summary.skipped.push(ItemOutcome::skipped(
                    describe_light(light),
                    format!("no usable master for {} frames", pending.len()),
                ));
                continue;
            }

            for (i, frame) in pending.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Ok(self.cancelled(summary));
                }
                report(
                    progress,
                    phase,
                    Some(frame.path.display().to_string()),
                    format!("{} frame {}/{}", describe_light(light), i + 1, pending.len()),
                );
                match self.calibrate_frame(light, frame, &masters) {
                    Ok(omitted) => {
                        summary.frames_calibrated += 1;
                        if !omitted.is_empty() {
                            summary.partial.push(ItemOutcome {
                                item: frame.path.display().to_string(),
                                reason: format!("calibrated without {}", omitted.join(", ")),
                                class: Some(ErrorClass::ResolutionGap),
                            });
                        }
                    }
                    Err(FrameOutcome::Skipped(reason)) => {
                        summary
                            .skipped
                            .push(ItemOutcome::skipped(frame.path.display().to_string(), reason));
                    }
                    Err(FrameOutcome::Failed(err)) => {
                        if let Flow::Stop =
                            self.failure(&mut summary, frame.path.display().to_string(), err)
                        {
                            return Ok(summary);
                        }
                    }
                }
            }
        }

        self.finalize(&summary, progress);
        Ok(summary)
    }

    fn scope(&self, filter: Option<&SessionId>) -> Result<Scope, CalibrationError> {
        let lights = self.catalog.light_sessions()?;
        let calibrations = self.catalog.calibration_sessions()?;
        let Some(id) = filter else {
            return Ok(Scope {
                lights,
                calibrations,
            });
        };

        match self.catalog.get_session(id)? {
            Some(Session::Light(light)) => {
                let pool = self.index.pool(self.catalog)?;
                let referenced: HashSet<SessionId> = self
                    .resolver
                    .resolve(&light, &pool)
                    .references()
                    .into_iter()
                    .filter_map(|r| match r {
                        CalibrationRef::Session(id) => Some(id),
                        CalibrationRef::Master(_) => None,
                    })
                    .collect();
                Ok(Scope {
                    calibrations: calibrations
                        .into_iter()
                        .filter(|c| referenced.contains(&c.id))
                        .collect(),
                    lights: vec![light],
                })
            }
            Some(Session::Calibration(cal)) => {
                let pool = self.index.pool(self.catalog)?;
                let lights = lights
                    .into_iter()
                    .filter(|l| {
                        self.resolver
                            .resolve(l, &pool)
                            .references()
                            .contains(&CalibrationRef::Session(cal.id))
                    })
                    .collect();
                Ok(Scope {
                    lights,
                    calibrations: vec![cal],
                })
            }
            None => Err(CalibrationError::NotFound(format!("session {}", short_hex(id)))),
        }
    }

    /// Re-read the scoped sessions after masters were committed
    fn refresh(&self, scope: Scope) -> Result<Scope, CalibrationError> {
        let light_ids: BTreeSet<SessionId> = scope.lights.iter().map(|s| s.id).collect();
        Ok(Scope {
            lights: self
                .catalog
                .light_sessions()?
                .into_iter()
                .filter(|s| light_ids.contains(&s.id))
                .collect(),
            calibrations: scope.calibrations,
        })
    }

    fn analyze(
        &self,
        scope: &Scope,
        summary: &mut Summary,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<CalibrationSession>, CalibrationError> {
        let phase = Phase::Analyze;
        let min_frames = self.masters.settings().min_frames;
        let active: HashSet<Hash> = self
            .catalog
            .list_frames()?
            .into_iter()
            .filter(|f| f.is_active())
            .map(|f| f.hash)
            .collect();

        let mut opportunities = Vec::new();
        for session in &scope.calibrations {
            if cancel.is_cancelled() {
                return Err(CalibrationError::Cancelled);
            }
            report(progress, phase, Some(describe_calibration(session)), "Checking calibration session");
            if session.master.is_some() {
                continue;
            }
            let count = session.frames.iter().filter(|h| active.contains(*h)).count();
            if count >= min_frames {
                summary.masters_planned.push(to_hex(&session.id));
                opportunities.push(session.clone());
            } else if count > 0 {
                summary.skipped.push(ItemOutcome::skipped(
                    describe_calibration(session),
                    format!("{count} active frames; at least {min_frames} required for a master"),
                ));
            }
        }

        let pool = self.index.pool(self.catalog)?;
        for light in &scope.lights {
            if cancel.is_cancelled() {
                return Err(CalibrationError::Cancelled);
            }
            report(progress, phase, Some(describe_light(light)), "Checking light session");
            let resolution = self.resolver.resolve(light, &pool);
            if !resolution.is_complete() {
                debug!(session = %short_hex(&light.id), gaps = ?resolution.gaps(), "Light session lacks coverage");
            }
            if summary.dry_run {
                record_gaps(summary, light, &resolution);
            }
            let frames = self.catalog.frames_for(&light.frames)?;
            summary.frames_planned += frames.iter().filter(|f| needs_calibration(f)).count();
        }
        debug!(
            masters = opportunities.len(),
            frames = summary.frames_planned,
            "Analysis complete"
        );
        Ok(opportunities)
    }

    fn resolve_links(
        &self,
        scope: &Scope,
        summary: &mut Summary,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<BTreeMap<SessionId, Resolution>, CalibrationError> {
        let phase = Phase::ResolveLinks;
        let pool = self.index.pool(self.catalog)?;
        let mut links = BTreeMap::new();
        for light in &scope.lights {
            if cancel.is_cancelled() {
                return Err(CalibrationError::Cancelled);
            }
            report(progress, phase, Some(describe_light(light)), "Resolving calibration");
            let resolution = self.resolver.resolve(light, &pool);
            record_gaps(summary, light, &resolution);
            links.insert(light.id, resolution);
        }
        self.catalog.store_links(&links)?;
        summary.links_resolved = links.len();
        Ok(links)
    }

    /// Masters referenced by a resolution, keyed by role. Raw-session references are not usable.
    fn usable_masters(&self, resolution: &Resolution) -> Result<SessionMasters, CalibrationError> {
        let load = |reference: Option<CalibrationRef>| -> Result<Option<Master>, CalibrationError> {
            match reference.and_then(|r| r.master_hash()) {
                Some(hash) => Ok(Some(self.catalog.get_master(&hash)?.ok_or_else(|| {
                    CalibrationError::CatalogIntegrity(format!(
                        "link references unknown master {}",
                        short_hex(&hash)
                    ))
                })?)),
                None => Ok(None),
            }
        };
        let mut darks = BTreeMap::new();
        for (exposure, reference) in &resolution.darks {
            if let Some(master) = load(*reference)? {
                darks.insert(*exposure, master);
            }
        }
        let mut flats = BTreeMap::new();
        for (filter, reference) in &resolution.flats {
            if let Some(master) = load(*reference)? {
                flats.insert(filter.clone(), master);
            }
        }
        Ok(SessionMasters {
            bias: load(resolution.bias)?,
            darks,
            flats,
        })
    }

    /// Calibrate one frame; returns the calibration kinds it was calibrated without
    fn calibrate_frame(
        &self,
        light: &LightSession,
        frame: &Frame,
        masters: &SessionMasters,
    ) -> Result<Vec<String>, FrameOutcome> {
        let exposure = frame.acquisition.exposure_ms();
        let filter = filter_key(&frame.acquisition.filter);
        let bias = masters.bias.as_ref();
        let dark = masters.darks.get(&exposure);
        let flat = masters.flats.get(&filter);
        if bias.is_none() && dark.is_none() && flat.is_none() {
            return Err(FrameOutcome::Skipped(
                "no usable master for this frame".to_string(),
            ));
        }
        let mut omitted = Vec::new();
        if bias.is_none() {
            omitted.push("bias".to_string());
        }
        if dark.is_none() {
            omitted.push(format!("dark[{}]", exposure_label(exposure)));
        }
        if flat.is_none() {
            omitted.push(format!("flat[{}]", filter));
        }

        let output_dir = output_dir(&self.output_root, light);
        let request = CalibrationRequest {
            light: frame.path.clone(),
            bias: bias.map(|m| m.path.clone()),
            dark: dark.map(|m| m.path.clone()),
            flat: flat.map(|m| m.path.clone()),
            output_dir,
        };
        let output = self
            .calibrator
            .calibrate(&request)
            .map_err(FrameOutcome::Failed)?;

        let provenance = CalibrationProvenance {
            bias: bias.map(Master::reference),
            dark: dark.map(Master::reference),
            flat: flat.map(Master::reference),
            output_path: output.clone(),
            calibrated_at: Utc::now(),
        };
        self.metadata
            .write_header(&output, &provenance_fields(&provenance))
            .map_err(FrameOutcome::Failed)?;
        let updated = self
            .catalog
            .mark_calibrated(&frame.hash, &provenance)
            .map_err(FrameOutcome::Failed)?;
        debug!(
            frame = %short_hex(&updated.hash),
            output = ?output,
            omitted = ?omitted,
            "Calibrated light frame"
        );
        Ok(omitted)
    }

    fn failure(&self, summary: &mut Summary, item: String, err: CalibrationError) -> Flow {
        match err {
            CalibrationError::Cancelled => {
                summary.cancelled = true;
                info!("Auto-calibration cancelled");
                Flow::Stop
            }
            err if err.halts_phase() => {
                warn!(item = %item, error = %err, "Catalog integrity failure; halting run");
                summary.halted = Some(err.to_string());
                summary.failures.push(ItemOutcome::failed(item, &err));
                Flow::Stop
            }
            err => {
                warn!(item = %item, error = %err, "Work item failed");
                summary.failures.push(ItemOutcome::failed(item, &err));
                Flow::Continue
            }
        }
    }

    fn cancelled(&self, mut summary: Summary) -> Summary {
        summary.cancelled = true;
        info!("Auto-calibration cancelled");
        summary
    }

    fn finalize(&self, summary: &Summary, progress: &dyn ProgressSink) {
        report(progress, Phase::Finalize, None, "Done");
        info!(
            dry_run = summary.dry_run,
            masters_created = summary.masters_created.len(),
            frames_calibrated = summary.frames_calibrated,
            skipped = summary.skipped.len(),
            errors = summary.error_count(),
            "Auto-calibration finished"
        );
    }
}

struct SessionMasters {
    bias: Option<Master>,
    /// Keyed by exposure in milliseconds
    darks: BTreeMap<u64, Master>,
    /// Keyed by filter name, `""` for unfiltered
    flats: BTreeMap<String, Master>,
}

impl SessionMasters {
    fn is_empty(&self) -> bool {
        self.bias.is_none() && self.darks.is_empty() && self.flats.is_empty()
    }
}

enum FrameOutcome {
    Skipped(String),
    Failed(CalibrationError),
}

fn record_gaps(summary: &mut Summary, light: &LightSession, resolution: &Resolution) {
    for gap in resolution.gaps() {
        summary.resolution_gaps.push(ItemOutcome {
            item: describe_light(light),
            reason: format!("no {gap} calibration"),
            class: Some(ErrorClass::ResolutionGap),
        });
    }
}

fn needs_calibration(frame: &Frame) -> bool {
    frame.is_active() && frame.calibration == CalibrationStatus::Uncalibrated
}

fn report(progress: &dyn ProgressSink, phase: Phase, item: Option<String>, message: impl Into<String>) {
    let mut update = ProgressUpdate::new(phase.index(), Phase::ALL.len(), message);
    update.current_item = item;
    progress.report(update);
}

fn provenance_fields(provenance: &CalibrationProvenance) -> FieldMap {
    let name = |m: &Option<MasterRef>| {
        m.as_ref()
            .and_then(|r| r.path.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    };
    let mut status = String::new();
    let mut fields = FieldMap::new();
    for (letter, key, master) in [
        ('B', keys::MASTER_BIAS, &provenance.bias),
        ('D', keys::MASTER_DARK, &provenance.dark),
        ('F', keys::MASTER_FLAT, &provenance.flat),
    ] {
        if let Some(file) = name(master) {
            status.push(letter);
            fields = fields.with_extra(key, file);
        }
    }
    fields.with_extra(keys::CALSTAT, status)
}

/// `<root>/<object>/<YYYYMMDD>_<session>`: one directory per light session
fn output_dir(root: &Path, light: &LightSession) -> PathBuf {
    root.join(sanitize(light.object.as_deref().unwrap_or("unknown")))
        .join(format!(
            "{}_{}",
            light.observed_at.format("%Y%m%d"),
            short_hex(&light.id)
        ))
}

fn describe_light(session: &LightSession) -> String {
    format!(
        "light {} [{}]",
        session.object.as_deref().unwrap_or("unknown"),
        short_hex(&session.id)
    )
}

fn describe_calibration(session: &CalibrationSession) -> String {
    format!("{} [{}]", session.kind, short_hex(&session.id))
}
