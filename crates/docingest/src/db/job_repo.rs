//! Job repository: CRUD for the `jobs` table.
//!
//! Functions take a `Connection` so the job store can run a read and the
//! following write inside one transaction.

use std::collections::VecDeque;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_timestamp, parse_timestamp};
use crate::error::StoreError;
use crate::jobs::{ItemFailure, Job, JobKind, JobState};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub source: String,
    pub recursive: bool,
    pub state: String,
    pub total: i64,
    pub processed: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub document_ids: String,
    pub failures: String,
    pub last_error: Option<String>,
    pub result_limit: i64,
    pub created_at: String,
    pub updated_at: String,
    pub owner: Option<String>,
    pub heartbeat_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            source: row.get("source")?,
            recursive: row.get("recursive")?,
            state: row.get("state")?,
            total: row.get("total")?,
            processed: row.get("processed")?,
            succeeded: row.get("succeeded")?,
            failed: row.get("failed")?,
            document_ids: row.get("document_ids")?,
            failures: row.get("failures")?,
            last_error: row.get("last_error")?,
            result_limit: row.get("result_limit")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            owner: row.get("owner")?,
            heartbeat_at: row.get("heartbeat_at")?,
        })
    }

    pub fn from_job(job: &Job) -> Result<Self, StoreError> {
        Ok(Self {
            id: job.id.clone(),
            kind: job.kind.as_str().to_string(),
            source: job.source.clone(),
            recursive: job.recursive,
            state: job.state.as_str().to_string(),
            total: job.total as i64,
            processed: job.processed as i64,
            succeeded: job.succeeded as i64,
            failed: job.failed as i64,
            document_ids: serde_json::to_string(&job.document_ids)?,
            failures: serde_json::to_string(&job.failures)?,
            last_error: job.last_error.clone(),
            result_limit: job.result_limit as i64,
            created_at: format_timestamp(job.created_at),
            updated_at: format_timestamp(job.updated_at),
            owner: job.owner.clone(),
            heartbeat_at: job.heartbeat_at.map(format_timestamp),
        })
    }

    pub fn into_job(self) -> Result<Job, StoreError> {
        let state = JobState::parse(&self.state).unwrap_or_else(|| {
            log::warn!(
                "Unknown job state '{}' for job {}, treating as failed",
                self.state,
                self.id
            );
            JobState::Failed
        });
        let kind = JobKind::parse(&self.kind).unwrap_or_else(|| {
            log::warn!(
                "Unknown job kind '{}' for job {}, treating as batch",
                self.kind,
                self.id
            );
            JobKind::Batch
        });
        let document_ids: VecDeque<i64> = serde_json::from_str(&self.document_ids)?;
        let failures: Vec<ItemFailure> = serde_json::from_str(&self.failures)?;

        Ok(Job {
            id: self.id,
            kind,
            source: self.source,
            recursive: self.recursive,
            state,
            total: self.total.max(0) as usize,
            processed: self.processed.max(0) as usize,
            succeeded: self.succeeded.max(0) as usize,
            failed: self.failed.max(0) as usize,
            document_ids,
            failures,
            last_error: self.last_error,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
            owner: self.owner,
            heartbeat_at: self.heartbeat_at.as_deref().map(parse_timestamp),
            result_limit: self.result_limit.max(1) as usize,
        })
    }
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO jobs (id, kind, source, recursive, state, total, processed, succeeded,
         failed, document_ids, failures, last_error, result_limit, created_at, updated_at,
         owner, heartbeat_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            job.id,
            job.kind,
            job.source,
            job.recursive,
            job.state,
            job.total,
            job.processed,
            job.succeeded,
            job.failed,
            job.document_ids,
            job.failures,
            job.last_error,
            job.result_limit,
            job.created_at,
            job.updated_at,
            job.owner,
            job.heartbeat_at,
        ],
    )?;
    Ok(())
}

/// Overwrites the progress columns of an existing job row. Ownership and
/// heartbeat columns are left to [`touch_heartbeat`].
pub fn update(conn: &Connection, job: &JobRow) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE jobs SET state=?2, total=?3, processed=?4, succeeded=?5, failed=?6,
         document_ids=?7, failures=?8, last_error=?9, updated_at=?10
         WHERE id=?1",
        params![
            job.id,
            job.state,
            job.total,
            job.processed,
            job.succeeded,
            job.failed,
            job.document_ids,
            job.failures,
            job.last_error,
            job.updated_at,
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT * FROM jobs WHERE id = ?1",
        params![id],
        JobRow::from_row,
    )
    .optional()
}

pub fn exists(conn: &Connection, id: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM jobs WHERE id = ?1)",
        params![id],
        |r| r.get(0),
    )
}

/// All rows, newest first.
pub fn list(conn: &Connection) -> Result<Vec<JobRow>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at DESC, id")?;
    let rows = stmt
        .query_map([], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Rows in the given states, newest first.
pub fn find_by_states(conn: &Connection, states: &[JobState]) -> Result<Vec<JobRow>, rusqlite::Error> {
    let mut rows = Vec::new();
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE state = ?1")?;
    for state in states {
        let found = stmt
            .query_map(params![state.as_str()], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.extend(found);
    }
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(rows)
}

/// Stamps `at` on every queued or running job owned by `owner`; returns
/// how many rows were touched.
pub fn touch_heartbeat(conn: &Connection, owner: &str, at: &str) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE jobs SET heartbeat_at = ?2
         WHERE owner = ?1 AND state IN ('queued', 'running')",
        params![owner, at],
    )
}

pub fn delete(conn: &Connection, id: &str) -> Result<bool, rusqlite::Error> {
    Ok(conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])? > 0)
}
