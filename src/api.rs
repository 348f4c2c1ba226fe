//! Calibration API
//!
//! Owns the catalog, configuration and collaborators and exposes the batch entry points:
//! import, session regeneration, auto-calibration and retention. Mutating jobs run one at
//! a time behind a single job slot; a second request while one is active fails with
//! `Busy`. Every job is recorded in the job history, and jobs left active by a process
//! that died are marked interrupted when the API opens.

use crate::catalog::{Catalog, Frame};
use crate::collaborators::{
    Calibrator, CloudStorage, CommandCalibrator, CommandCombiner, Combiner, FrameMetadata,
    MirrorStorage, QualityAssessor, SidecarMetadata, Unconfigured, Unscored,
};
use crate::config::{validation_failure, AstrocalConfig};
use crate::error::{CalibrationError, StorageError};
use crate::import::{ImportReport, Importer};
use crate::master::{Master, MasterManager, MasterRequest, MasterSettings, MasterValidation};
use crate::orchestrator::{Orchestrator, RunOptions, Summary};
use crate::progress::{
    new_job_id, now_millis, CancellationToken, JobRecord, JobStatus, JobStore, NullProgress,
    ProgressSink,
};
use crate::regeneration::{RegenerationReport, Regenerator};
use crate::resolver::{Resolution, Resolver};
use crate::retention::{RetentionManager, RetentionPolicy, RetentionReport};
use crate::session::{Session, SessionGrouper, SessionIndex};
use crate::types::{short_hex, to_hex, SessionId};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// The external tools the engine drives
#[derive(Clone)]
pub struct Collaborators {
    pub metadata: Arc<dyn FrameMetadata>,
    pub combiner: Arc<dyn Combiner>,
    pub calibrator: Arc<dyn Calibrator>,
    pub quality: Arc<dyn QualityAssessor>,
    /// Absent when no archive is configured; retention is then unavailable
    pub cloud: Option<Arc<dyn CloudStorage>>,
}

impl Collaborators {
    /// Command-line tools and a mirror archive as configured; sidecar headers, no scoring
    pub fn from_config(config: &AstrocalConfig) -> Result<Self, CalibrationError> {
        let combiner: Arc<dyn Combiner> = match &config.combiner.program {
            Some(program) => Arc::new(CommandCombiner::new(program, config.combiner.args.clone())),
            None => Arc::new(Unconfigured("combiner")),
        };
        let calibrator: Arc<dyn Calibrator> = match &config.calibrator.program {
            Some(program) => Arc::new(CommandCalibrator::new(
                program,
                config.calibrator.args.clone(),
            )),
            None => Arc::new(Unconfigured("calibrator")),
        };
        let cloud: Option<Arc<dyn CloudStorage>> = match &config.cloud.mirror_root {
            Some(root) => Some(Arc::new(MirrorStorage::new(root)?)),
            None => None,
        };
        Ok(Self {
            metadata: Arc::new(SidecarMetadata),
            combiner,
            calibrator,
            quality: Arc::new(Unscored),
            cloud,
        })
    }
}

/// Maps a finished job's report onto its recorded status
pub trait JobOutcome {
    fn status(&self) -> JobStatus {
        JobStatus::Completed
    }
}

impl JobOutcome for Summary {
    fn status(&self) -> JobStatus {
        if self.cancelled {
            JobStatus::Cancelled
        } else if self.halted.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }
}

impl JobOutcome for RetentionReport {
    fn status(&self) -> JobStatus {
        if self.cancelled {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        }
    }
}

impl JobOutcome for ImportReport {
    fn status(&self) -> JobStatus {
        if self.cancelled {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        }
    }
}

impl JobOutcome for RegenerationReport {}

impl JobOutcome for Master {}

/// The job currently holding the slot
#[derive(Clone)]
struct ActiveJob {
    job_id: String,
    command: &'static str,
    token: CancellationToken,
}

type JobSlot = Arc<Mutex<Option<ActiveJob>>>;

/// Holds the job slot for one job and frees it on drop
struct JobGuard {
    slot: JobSlot,
    record: JobRecord,
    token: CancellationToken,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

/// A master and the result of checking its file
#[derive(Debug, Clone, Serialize)]
pub struct MasterCheck {
    pub master: Master,
    pub validation: MasterValidation,
}

/// Auto-calibration running on the background worker
pub struct JobHandle {
    job_id: String,
    token: CancellationToken,
    handle: JoinHandle<Result<Summary, CalibrationError>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker and return its summary
    pub fn join(self) -> Result<Summary, CalibrationError> {
        self.handle
            .join()
            .map_err(|_| CalibrationError::external("worker", "auto-calibration thread panicked"))?
    }
}

pub struct CalibrationApi {
    catalog: Arc<Catalog>,
    config: AstrocalConfig,
    collaborators: Collaborators,
    grouper: SessionGrouper,
    resolver: Resolver,
    masters: MasterManager,
    index: SessionIndex,
    jobs: JobStore,
    slot: JobSlot,
    progress: Arc<dyn ProgressSink>,
}

impl CalibrationApi {
    /// Open the workspace's catalog with collaborators built from `config`
    pub fn open(workspace_root: &Path, mut config: AstrocalConfig) -> Result<Self, CalibrationError> {
        config.resolve_paths(workspace_root);
        config.validate().map_err(|errors| validation_failure(&errors))?;
        let catalog = Arc::new(Catalog::open(&config.storage.catalog_path)?);
        let collaborators = Collaborators::from_config(&config)?;
        Self::with_collaborators(config, catalog, collaborators)
    }

    pub fn with_collaborators(
        config: AstrocalConfig,
        catalog: Arc<Catalog>,
        collaborators: Collaborators,
    ) -> Result<Self, CalibrationError> {
        let jobs = JobStore::new(catalog.db().clone())?;
        let interrupted = jobs.mark_interrupted()?;
        if interrupted > 0 {
            warn!(interrupted, "Marked jobs from a previous process as interrupted");
        }
        let prune = config.jobs.prune_policy();
        jobs.prune(prune.max_finished, prune.max_age_ms, now_millis())?;

        let masters = MasterManager::new(
            Arc::clone(&catalog),
            Arc::clone(&collaborators.combiner),
            Arc::clone(&collaborators.metadata),
            Arc::clone(&collaborators.quality),
            MasterSettings {
                min_frames: config.masters.min_frames_per_master,
                min_quality: config.masters.min_quality,
                library_root: config.storage.library_root.clone(),
            },
        );

        Ok(Self {
            grouper: SessionGrouper::with_window_hours(config.grouping.night_window_hours),
            resolver: Resolver::new(config.matching.dark_temperature_tolerance_c),
            masters,
            index: SessionIndex::new(),
            jobs,
            slot: Arc::new(Mutex::new(None)),
            progress: Arc::new(NullProgress),
            catalog,
            config,
            collaborators,
        })
    }

    /// Receive progress updates from every job
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &AstrocalConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Catalogue every exposure under `root`
    pub fn import_directory(&self, root: &Path) -> Result<ImportReport, CalibrationError> {
        let guard = self.begin("import")?;
        let importer = Importer::new(
            &self.catalog,
            self.collaborators.metadata.as_ref(),
            self.config.import.options(),
        );
        let result = importer.import_directory(root, &guard.token);
        self.finish(guard, result)
    }

    /// Rebuild sessions and links; without `force` a fully grouped catalog is left alone
    pub fn regenerate_sessions(&self, force: bool) -> Result<RegenerationReport, CalibrationError> {
        let guard = self.begin("regenerate")?;
        let regenerator = Regenerator::new(&self.catalog, &self.grouper, &self.resolver);
        let result = regenerator.regenerate(force, &guard.token, self.progress.as_ref());
        if result.is_ok() {
            self.index.invalidate();
        }
        self.finish(guard, result)
    }

    /// Run the five-phase auto-calibration job on the calling thread
    pub fn run_auto_calibration(
        &self,
        dry_run: bool,
        session_filter: Option<SessionId>,
    ) -> Result<Summary, CalibrationError> {
        let guard = self.begin("calibrate")?;
        let result = self.auto_calibrate(&guard.token, dry_run, session_filter);
        self.finish(guard, result)
    }

    /// Run auto-calibration on the background worker. The slot is taken before this
    /// returns, so a concurrent request fails with `Busy` immediately.
    pub fn spawn_auto_calibration(
        self: &Arc<Self>,
        dry_run: bool,
        session_filter: Option<SessionId>,
    ) -> Result<JobHandle, CalibrationError> {
        let guard = self.begin("calibrate")?;
        let job_id = guard.record.job_id.clone();
        let token = guard.token.clone();
        let api = Arc::clone(self);

        let handle = std::thread::Builder::new()
            .name("astrocal-worker".to_string())
            .spawn(move || {
                let result = api.auto_calibrate(&guard.token, dry_run, session_filter);
                api.finish(guard, result)
            })
            .map_err(StorageError::from)?;

        Ok(JobHandle {
            job_id,
            token,
            handle,
        })
    }

    /// Combine one calibration session into a master. With `force`, an existing master
    /// is rebuilt from the same sources and replaced.
    pub fn create_master(&self, session: &SessionId, force: bool) -> Result<Master, CalibrationError> {
        let guard = self.begin("master")?;
        let result = match self.catalog.get_session(session) {
            Ok(Some(Session::Calibration(calibration))) => {
                self.masters
                    .create_master(&calibration, &MasterRequest { force }, &guard.token)
            }
            Ok(_) => Err(CalibrationError::NotFound(format!(
                "calibration session {}",
                to_hex(session)
            ))),
            Err(err) => Err(err.into()),
        };
        if result.is_ok() {
            self.index.invalidate();
        }
        self.finish(guard, result)
    }

    /// Apply a retention policy to soft-deleted frames
    pub fn apply_retention(&self, policy: RetentionPolicy) -> Result<RetentionReport, CalibrationError> {
        let Some(cloud) = self.collaborators.cloud.as_deref() else {
            return Err(CalibrationError::Config(
                "no cloud archive configured; set [cloud] mirror_root".to_string(),
            ));
        };
        let guard = self.begin("retention")?;
        let manager = RetentionManager::new(&self.catalog, cloud);
        let result = tokio::runtime::Runtime::new()
            .map_err(|e| CalibrationError::Config(format!("Failed to start async runtime: {}", e)))
            .and_then(|runtime| runtime.block_on(manager.apply(policy, &guard.token)));
        self.finish(guard, result)
    }

    /// Check every master's file against its recorded hash
    pub fn validate_masters(&self) -> Result<Vec<MasterCheck>, CalibrationError> {
        let mut checks = Vec::new();
        for master in self.catalog.list_masters()? {
            let validation = self.masters.validate_master(&master)?;
            checks.push(MasterCheck { master, validation });
        }
        let broken = checks.iter().filter(|c| !c.validation.is_valid()).count();
        info!(masters = checks.len(), broken, "Validated masters");
        Ok(checks)
    }

    /// Resolve calibration data for a light session against the current catalog
    pub fn resolve(&self, session: &SessionId) -> Result<Resolution, CalibrationError> {
        let Some(Session::Light(light)) = self.catalog.get_session(session)? else {
            return Err(CalibrationError::NotFound(format!(
                "light session {}",
                to_hex(session)
            )));
        };
        let pool = self.index.pool(&self.catalog)?;
        Ok(self.resolver.resolve(&light, &pool))
    }

    /// Session whose hex id starts with `prefix`
    pub fn find_session(&self, prefix: &str) -> Result<Session, CalibrationError> {
        let prefix = prefix.trim().trim_start_matches("0x").to_ascii_lowercase();
        let mut matches = self
            .catalog
            .list_sessions()?
            .into_iter()
            .filter(|s| to_hex(&s.id()).starts_with(&prefix));
        match (matches.next(), matches.next()) {
            (Some(session), None) if !prefix.is_empty() => Ok(session),
            (Some(_), Some(_)) => Err(CalibrationError::NotFound(format!(
                "session prefix {} is ambiguous",
                prefix
            ))),
            _ => Err(CalibrationError::NotFound(format!("session {}", prefix))),
        }
    }

    pub fn sessions(&self) -> Result<Vec<Session>, CalibrationError> {
        Ok(self.catalog.list_sessions()?)
    }

    pub fn frames(&self) -> Result<Vec<Frame>, CalibrationError> {
        Ok(self.catalog.list_frames()?)
    }

    pub fn masters(&self) -> Result<Vec<Master>, CalibrationError> {
        Ok(self.catalog.list_masters()?)
    }

    pub fn links(&self) -> Result<Vec<(SessionId, Resolution)>, CalibrationError> {
        Ok(self.catalog.list_links()?)
    }

    /// Job history, newest first
    pub fn jobs(&self) -> Result<Vec<JobRecord>, CalibrationError> {
        Ok(self.jobs.list()?)
    }

    /// Id and command of the job holding the slot
    pub fn active_job(&self) -> Option<(String, &'static str)> {
        self.slot
            .lock()
            .as_ref()
            .map(|job| (job.job_id.clone(), job.command))
    }

    /// Request cancellation of the running job; false when none is running
    pub fn cancel_current(&self) -> bool {
        match self.slot.lock().as_ref() {
            Some(job) => {
                job.token.cancel();
                info!(job_id = %job.job_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    fn auto_calibrate(
        &self,
        cancel: &CancellationToken,
        dry_run: bool,
        session_filter: Option<SessionId>,
    ) -> Result<Summary, CalibrationError> {
        let orchestrator = Orchestrator::new(
            &self.catalog,
            &self.index,
            &self.resolver,
            &self.masters,
            self.collaborators.calibrator.as_ref(),
            self.collaborators.metadata.as_ref(),
            self.config.storage.calibrated_dir.clone(),
        );
        let options = RunOptions {
            dry_run,
            session_filter,
        };
        orchestrator.run(&options, cancel, self.progress.as_ref())
    }

    /// Take the job slot and record the job as active
    fn begin(&self, command: &'static str) -> Result<JobGuard, CalibrationError> {
        let token = CancellationToken::new();
        let record = JobRecord::started(new_job_id(), command);
        {
            let mut slot = self.slot.lock();
            if let Some(active) = slot.as_ref() {
                return Err(CalibrationError::Busy(format!(
                    "{} ({})",
                    active.command, active.job_id
                )));
            }
            *slot = Some(ActiveJob {
                job_id: record.job_id.clone(),
                command,
                token: token.clone(),
            });
        }
        let guard = JobGuard {
            slot: Arc::clone(&self.slot),
            record,
            token,
        };
        self.jobs.put(&guard.record)?;
        info!(job_id = %guard.record.job_id, command, "Job started");
        Ok(guard)
    }

    /// Record how the job ended, then free the slot
    fn finish<T: Serialize + JobOutcome>(
        &self,
        mut guard: JobGuard,
        result: Result<T, CalibrationError>,
    ) -> Result<T, CalibrationError> {
        match &result {
            Ok(report) => {
                let summary = serde_json::to_value(report).ok();
                guard.record.finish(report.status(), summary, None);
            }
            Err(CalibrationError::Cancelled) => {
                guard
                    .record
                    .finish(JobStatus::Cancelled, None, Some(CalibrationError::Cancelled.to_string()));
            }
            Err(err) => {
                guard.record.finish(JobStatus::Failed, None, Some(err.to_string()));
            }
        }
        let status = guard.record.status;
        if let Err(err) = self.jobs.put(&guard.record) {
            warn!(job_id = %guard.record.job_id, error = %err, "Failed to record job outcome");
        }
        info!(job_id = %guard.record.job_id, status = status.as_str(), "Job finished");
        drop(guard);
        result
    }
}

impl std::fmt::Debug for CalibrationApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationApi")
            .field("catalog", &self.config.storage.catalog_path)
            .field("active_job", &self.active_job().map(|(id, _)| id))
            .field("generation", &self.catalog.generation())
            .finish()
    }
}

/// Short label for a session in messages
pub fn describe_session(session: &Session) -> String {
    format!("{} {}", session.kind_label(), short_hex(&session.id()))
}
