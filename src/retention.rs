//! Lifecycle / Retention
//!
//! Moves soft-deleted frames toward cloud-archived under one of three policies. A local
//! file is removed only after the cloud reported an object with the frame's exact content
//! hash; any other answer leaves the frame in place and is reported as retryable.

use std::fmt;
use std::fs;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CloudLocation, Frame, LifecycleState};
use crate::collaborators::CloudStorage;
use crate::error::{CalibrationError, ErrorClass, StorageError};
use crate::orchestrator::ItemOutcome;
use crate::progress::CancellationToken;
use crate::types::{short_hex, to_hex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    /// Upload, verify, then delete the local copy
    BackupOnly,
    /// Upload and verify; never delete locally
    CompleteBidirectional,
    /// Never upload; delete only frames with a recorded cloud copy, after verification
    OnDemand,
}

impl RetentionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RetentionPolicy::BackupOnly => "backup-only",
            RetentionPolicy::CompleteBidirectional => "complete-bidirectional",
            RetentionPolicy::OnDemand => "on-demand",
        }
    }

    fn uploads(self) -> bool {
        !matches!(self, RetentionPolicy::OnDemand)
    }

    fn deletes_local(self) -> bool {
        !matches!(self, RetentionPolicy::CompleteBidirectional)
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "backup-only" | "backup" => Ok(RetentionPolicy::BackupOnly),
            "complete-bidirectional" | "complete" => Ok(RetentionPolicy::CompleteBidirectional),
            "on-demand" | "ondemand" => Ok(RetentionPolicy::OnDemand),
            _ => Err(format!("Invalid retention policy: {s}")),
        }
    }
}

/// Result of one retention pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub policy: RetentionPolicy,
    pub examined: usize,
    pub uploaded: usize,
    pub verified: usize,
    pub purged: usize,
    pub cancelled: bool,
    pub skipped: Vec<ItemOutcome>,
    /// Verification failures; the frame keeps its local copy and can be retried
    pub retryable: Vec<ItemOutcome>,
    pub failures: Vec<ItemOutcome>,
}

impl RetentionReport {
    fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            examined: 0,
            uploaded: 0,
            verified: 0,
            purged: 0,
            cancelled: false,
            skipped: Vec::new(),
            retryable: Vec::new(),
            failures: Vec::new(),
        }
    }
}

enum Step {
    Skipped(String),
    Done,
}

pub struct RetentionManager<'a> {
    catalog: &'a Catalog,
    cloud: &'a dyn CloudStorage,
}

impl<'a> RetentionManager<'a> {
    pub fn new(catalog: &'a Catalog, cloud: &'a dyn CloudStorage) -> Self {
        Self { catalog, cloud }
    }

    /// Frames awaiting retention work: soft-deleted, or purge pending verification
    pub fn candidates(&self) -> Result<Vec<Frame>, StorageError> {
        Ok(self
            .catalog
            .list_frames()?
            .into_iter()
            .filter(|f| {
                matches!(
                    f.lifecycle,
                    LifecycleState::SoftDeleted | LifecycleState::PurgedPendingVerification
                )
            })
            .collect())
    }

    pub async fn apply(
        &self,
        policy: RetentionPolicy,
        cancel: &CancellationToken,
    ) -> Result<RetentionReport, CalibrationError> {
        let mut report = RetentionReport::new(policy);
        let candidates = self.candidates()?;
        info!(policy = %policy, candidates = candidates.len(), "Applying retention policy");

        for frame in candidates {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.examined += 1;
            let item = frame.path.display().to_string();
            match self.process(policy, frame, &mut report).await {
                Ok(Step::Done) => {}
                Ok(Step::Skipped(reason)) => report.skipped.push(ItemOutcome::skipped(item, reason)),
                Err(err) if err.class() == ErrorClass::StorageVerificationFailure => {
                    warn!(item = %item, error = %err, "Cloud verification failed; keeping local copy");
                    report.retryable.push(ItemOutcome::failed(item, &err));
                }
                Err(err) if err.halts_phase() => return Err(err),
                Err(err) => {
                    warn!(item = %item, error = %err, "Retention failed for frame");
                    report.failures.push(ItemOutcome::failed(item, &err));
                }
            }
        }

        info!(
            policy = %policy,
            uploaded = report.uploaded,
            verified = report.verified,
            purged = report.purged,
            retryable = report.retryable.len(),
            "Retention pass finished"
        );
        Ok(report)
    }

    async fn process(
        &self,
        policy: RetentionPolicy,
        mut frame: Frame,
        report: &mut RetentionReport,
    ) -> Result<Step, CalibrationError> {
        let url = match (&frame.cloud, policy.uploads()) {
            (Some(cloud), _) => cloud.url.clone(),
            (None, true) => {
                if !frame.path.exists() {
                    return Err(CalibrationError::NotFound(format!(
                        "local file {:?}",
                        frame.path
                    )));
                }
                let url = self.cloud.upload(&frame.path, &frame.hash).await?;
                report.uploaded += 1;
                debug!(frame = %short_hex(&frame.hash), url = %url, "Uploaded frame");
                url
            }
            (None, false) => return Ok(Step::Skipped("no recorded cloud copy".to_string())),
        };
        let unverified = CloudLocation {
            url: url.clone(),
            verified: false,
        };

        if policy.deletes_local() && frame.lifecycle == LifecycleState::SoftDeleted {
            frame = self.catalog.update_retention(
                &frame.hash,
                LifecycleState::PurgedPendingVerification,
                Some(unverified),
            )?;
        } else if frame.cloud.is_none() {
            frame = self
                .catalog
                .update_retention(&frame.hash, frame.lifecycle, Some(unverified))?;
        }

        self.verify(&frame).await?;
        report.verified += 1;
        let verified = CloudLocation {
            url,
            verified: true,
        };

        if !policy.deletes_local() {
            self.catalog
                .update_retention(&frame.hash, frame.lifecycle, Some(verified))?;
            return Ok(Step::Done);
        }

        if let Err(err) = fs::remove_file(&frame.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(StorageError::from(err).into());
            }
        }
        self.catalog
            .update_retention(&frame.hash, LifecycleState::Purged, Some(verified))?;
        report.purged += 1;
        debug!(frame = %short_hex(&frame.hash), path = ?frame.path, "Purged local copy");
        Ok(Step::Done)
    }

    /// Verification gate: only an explicit `true` for this content hash passes
    async fn verify(&self, frame: &Frame) -> Result<(), CalibrationError> {
        let failed = |message: String| CalibrationError::StorageVerification {
            frame: to_hex(&frame.hash),
            message,
        };
        match self.cloud.exists(&frame.hash).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(failed("cloud reports no object with this content hash".to_string())),
            Err(err) => Err(failed(err.to_string())),
        }
    }
}
