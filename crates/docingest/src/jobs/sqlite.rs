use chrono::{DateTime, Utc};

use crate::db::job_repo::{self, JobRow};
use crate::db::{format_timestamp, Database};
use crate::error::StoreError;
use crate::jobs::job::{Job, JobState};
use crate::jobs::store::JobStore;

/// Job records in the `jobs` table, surviving restarts.
///
/// Each update reads, mutates and writes back inside a single
/// `BEGIN IMMEDIATE` transaction, so concurrent updates serialize.
#[derive(Clone)]
pub struct SqliteJobStore {
    db: Database,
}

impl SqliteJobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl JobStore for SqliteJobStore {
    fn create(&self, job: Job) -> Result<(), StoreError> {
        let row = JobRow::from_job(&job)?;
        self.db.transaction(|tx| {
            if job_repo::exists(tx, &row.id)? {
                return Err(StoreError::AlreadyExists(row.id.clone()));
            }
            job_repo::insert(tx, &row)?;
            Ok(())
        })
    }

    fn get(&self, id: &str) -> Result<Job, StoreError> {
        let row = self
            .db
            .with_conn(|conn| Ok(job_repo::find_by_id(conn, id)?))?;
        row.ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .into_job()
    }

    fn update(
        &self,
        id: &str,
        mutator: &mut dyn FnMut(&mut Job) -> Result<(), StoreError>,
    ) -> Result<Job, StoreError> {
        self.db.transaction(|tx| {
            let mut job = job_repo::find_by_id(tx, id)?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?
                .into_job()?;
            mutator(&mut job)?;
            job_repo::update(tx, &JobRow::from_job(&job)?)?;
            Ok(job)
        })
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .db
            .with_conn(|conn| Ok(job_repo::delete(conn, id)?))?)
    }

    fn list(&self) -> Result<Vec<Job>, StoreError> {
        self.db
            .with_conn(|conn| Ok(job_repo::list(conn)?))?
            .into_iter()
            .map(JobRow::into_job)
            .collect()
    }

    fn unfinished(&self) -> Result<Vec<Job>, StoreError> {
        self.db
            .with_conn(|conn| {
                Ok(job_repo::find_by_states(
                    conn,
                    &[JobState::Queued, JobState::Running],
                )?)
            })?
            .into_iter()
            .map(JobRow::into_job)
            .collect()
    }

    fn heartbeat(&self, owner: &str, at: DateTime<Utc>) -> Result<usize, StoreError> {
        let at = format_timestamp(at);
        Ok(self
            .db
            .with_conn(|conn| Ok(job_repo::touch_heartbeat(conn, owner, &at)?))?)
    }
}
