//! Durable sled-backed job history.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::{Db, Tree};

use crate::error::StorageError;
use crate::progress::session::{now_millis, JobStatus};

const TREE_JOBS: &str = "jobs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub command: String,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub status: JobStatus,
    /// Command-specific summary, e.g. the auto-calibration counts
    pub summary: Option<Value>,
    pub error: Option<String>,
}

impl JobRecord {
    pub fn started(job_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            command: command.into(),
            started_at_ms: now_millis(),
            ended_at_ms: None,
            status: JobStatus::Active,
            summary: None,
            error: None,
        }
    }

    pub fn finish(&mut self, status: JobStatus, summary: Option<Value>, error: Option<String>) {
        self.status = status;
        self.ended_at_ms = Some(now_millis());
        self.summary = summary;
        self.error = error;
    }
}

#[derive(Clone)]
pub struct JobStore {
    db: Db,
    jobs: Tree,
}

impl JobStore {
    pub fn new(db: Db) -> Result<Self, StorageError> {
        let jobs = db.open_tree(TREE_JOBS).map_err(to_storage_db)?;
        Ok(Self { db, jobs })
    }

    pub fn shared(db: Db) -> Result<Arc<Self>, StorageError> {
        Ok(Arc::new(Self::new(db)?))
    }

    pub fn put(&self, record: &JobRecord) -> Result<(), StorageError> {
        let value = serde_json::to_vec(record).map_err(to_storage_data)?;
        self.jobs
            .insert(record.job_id.as_bytes(), value)
            .map_err(to_storage_db)?;
        self.flush()
    }

    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StorageError> {
        let Some(raw) = self.jobs.get(job_id.as_bytes()).map_err(to_storage_db)? else {
            return Ok(None);
        };
        let parsed = serde_json::from_slice(&raw).map_err(to_storage_data)?;
        Ok(Some(parsed))
    }

    /// Newest first
    pub fn list(&self) -> Result<Vec<JobRecord>, StorageError> {
        let mut out = Vec::new();
        for result in self.jobs.iter() {
            let (_, value) = result.map_err(to_storage_db)?;
            let rec: JobRecord = serde_json::from_slice(&value).map_err(to_storage_data)?;
            out.push(rec);
        }
        out.sort_by_key(|j| std::cmp::Reverse(j.started_at_ms));
        Ok(out)
    }

    /// Jobs still `active` belong to a process that died; mark them interrupted
    pub fn mark_interrupted(&self) -> Result<usize, StorageError> {
        let mut changed = 0usize;
        for mut job in self.list()? {
            if job.status == JobStatus::Active {
                job.finish(JobStatus::Interrupted, job.summary.clone(), None);
                self.put(&job)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Drop finished jobs older than `max_age_ms`, then all but the newest `max_finished`
    pub fn prune(&self, max_finished: usize, max_age_ms: u64, now_ms: u64) -> Result<usize, StorageError> {
        let finished: Vec<JobRecord> = self
            .list()?
            .into_iter()
            .filter(|j| j.status.is_finished())
            .collect();
        let mut removed = 0usize;
        for (index, job) in finished.iter().enumerate() {
            let ended = job.ended_at_ms.unwrap_or(job.started_at_ms);
            if index >= max_finished || now_ms.saturating_sub(ended) > max_age_ms {
                self.jobs
                    .remove(job.job_id.as_bytes())
                    .map_err(to_storage_db)?;
                removed += 1;
            }
        }
        self.flush()?;
        Ok(removed)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(to_storage_db)?;
        Ok(())
    }
}

fn to_storage_db(err: sled::Error) -> StorageError {
    StorageError::Database(err.to_string())
}

fn to_storage_data(err: serde_json::Error) -> StorageError {
    StorageError::Serialization(err.to_string())
}
