use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// A directory scan.
    Batch,
    /// One or more uploaded files.
    Upload,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Batch => "batch",
            JobKind::Upload => "upload",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "batch" => Some(JobKind::Batch),
            "upload" => Some(JobKind::Upload),
            _ => None,
        }
    }
}

/// Why one item of a job produced no document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Source path of the item, or its upload name.
    pub item: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Scan root for batches, comma-separated names for uploads.
    pub source: String,
    #[serde(default)]
    pub recursive: bool,
    pub state: JobState,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Produced document ids, most recent first.
    pub document_ids: VecDeque<i64>,
    pub failures: Vec<ItemFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Instance id of the ingestor whose workers run this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Last liveness stamp from the owner. Not a change to the job, so it
    /// leaves `updated_at` alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(skip, default = "default_result_limit")]
    pub result_limit: usize,
}

fn default_result_limit() -> usize {
    Job::DEFAULT_RESULT_LIMIT
}

/// A change to a job. Every writer goes through [`Job::apply`] so the
/// counter invariants hold no matter which store holds the record.
#[derive(Debug, Clone, PartialEq)]
pub enum JobMutation {
    MarkRunning,
    RecordSuccess { document_id: i64 },
    RecordFailure { item: String, reason: String },
    Fail { reason: String },
}

impl Job {
    pub const DEFAULT_RESULT_LIMIT: usize = 100;

    /// A fresh job in `queued`. A job with nothing to do starts `completed`.
    pub fn new(kind: JobKind, source: impl Into<String>, total: usize) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            source: source.into(),
            recursive: false,
            state: if total == 0 {
                JobState::Completed
            } else {
                JobState::Queued
            },
            total,
            processed: 0,
            succeeded: 0,
            failed: 0,
            document_ids: VecDeque::new(),
            failures: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
            owner: None,
            heartbeat_at: None,
            result_limit: Self::DEFAULT_RESULT_LIMIT,
        }
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_result_limit(mut self, limit: usize) -> Self {
        self.result_limit = limit.max(1);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// A batch that could not be constructed, e.g. an unreadable root.
    pub fn rejected(kind: JobKind, source: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut job = Self::new(kind, source, 0);
        job.state = JobState::Failed;
        job.last_error = Some(reason);
        job
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// The later of the last update and the owner's last heartbeat.
    pub fn last_seen(&self) -> DateTime<Utc> {
        match self.heartbeat_at {
            Some(beat) => beat.max(self.updated_at),
            None => self.updated_at,
        }
    }

    /// Unfinished, owned by another ingestor (or none), and silent since
    /// `cutoff`. Such a job has no process left to finish it.
    pub fn is_orphaned(&self, owner: &str, cutoff: DateTime<Utc>) -> bool {
        !self.is_finished() && self.owner.as_deref() != Some(owner) && self.last_seen() < cutoff
    }

    pub fn progress_percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.processed * 100) / self.total).min(100) as u8
    }

    pub fn apply(&mut self, mutation: JobMutation) -> Result<(), StoreError> {
        match mutation {
            JobMutation::MarkRunning => {
                if self.state == JobState::Queued {
                    self.state = JobState::Running;
                }
            }
            JobMutation::RecordSuccess { document_id } => {
                self.begin_record()?;
                self.succeeded += 1;
                self.document_ids.retain(|id| *id != document_id);
                self.document_ids.push_front(document_id);
                self.document_ids.truncate(self.result_limit);
                self.finish_record();
            }
            JobMutation::RecordFailure { item, reason } => {
                self.begin_record()?;
                self.failed += 1;
                self.last_error = Some(format!("{}: {}", item, reason));
                self.failures.push(ItemFailure { item, reason });
                self.finish_record();
            }
            JobMutation::Fail { reason } => {
                if self.state == JobState::Completed {
                    return Err(self.violation("a completed job cannot fail"));
                }
                self.state = JobState::Failed;
                self.last_error = Some(reason);
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    fn begin_record(&mut self) -> Result<(), StoreError> {
        if self.processed >= self.total {
            return Err(self.violation(&format!(
                "all {} items already processed",
                self.total
            )));
        }
        if self.state == JobState::Queued {
            self.state = JobState::Running;
        }
        self.processed += 1;
        Ok(())
    }

    fn finish_record(&mut self) {
        if self.processed == self.total && self.state == JobState::Running {
            self.state = JobState::Completed;
        }
    }

    fn violation(&self, reason: &str) -> StoreError {
        StoreError::InvariantViolation {
            job_id: self.id.clone(),
            reason: reason.to_string(),
        }
    }

    /// `succeeded + failed == processed <= total`.
    pub fn counters_consistent(&self) -> bool {
        self.succeeded + self.failed == self.processed && self.processed <= self.total
    }
}
