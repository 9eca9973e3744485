use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::StoreError;
use crate::jobs::job::{Job, JobId};
use crate::jobs::store::JobStore;

/// Job records held in process memory.
///
/// Jobs do not survive a restart: a process that exits mid-batch leaves no
/// trace of the job, and pollers holding its id get `NotFound`.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(|poisoned| {
            log::warn!("Job store lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(|poisoned| {
            log::warn!("Job store lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl JobStore for MemoryJobStore {
    fn create(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.write();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Job, StoreError> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn update(
        &self,
        id: &str,
        mutator: &mut dyn FnMut(&mut Job) -> Result<(), StoreError>,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.write();
        let current = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        // Mutate a copy and swap it in, so a failed or panicking mutator
        // never leaves a half-applied record behind.
        let mut next = current.clone();
        mutator(&mut next)?;
        *current = next.clone();
        Ok(next)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.write().remove(id).is_some())
    }

    fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.read().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}
