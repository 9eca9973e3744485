use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::jobs::job::{Job, JobMutation};

/// Shared job records, written by the orchestrator and the workers and read
/// by pollers.
///
/// `update` is an atomic read-modify-write: the mutator sees the latest
/// record and no other update to the same job interleaves with it. If the
/// mutator returns an error the stored record is left untouched.
pub trait JobStore: Send + Sync {
    fn create(&self, job: Job) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Job, StoreError>;

    fn update(
        &self,
        id: &str,
        mutator: &mut dyn FnMut(&mut Job) -> Result<(), StoreError>,
    ) -> Result<Job, StoreError>;

    /// Returns whether a record was removed.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// All jobs, newest first.
    fn list(&self) -> Result<Vec<Job>, StoreError>;

    fn apply(&self, id: &str, mutation: JobMutation) -> Result<Job, StoreError> {
        let mut mutation = Some(mutation);
        self.update(id, &mut |job| match mutation.take() {
            Some(m) => job.apply(m),
            None => Ok(()),
        })
    }

    /// Jobs still `queued` or `running`, newest first.
    fn unfinished(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|job| !job.is_finished())
            .collect())
    }

    /// Stamps a heartbeat on the unfinished jobs `owner` runs; returns how
    /// many were stamped. Leaves `updated_at` alone.
    fn heartbeat(&self, owner: &str, at: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut stamped = 0;
        for job in self.unfinished()? {
            if job.owner.as_deref() != Some(owner) {
                continue;
            }
            self.update(&job.id, &mut |job| {
                if !job.is_finished() {
                    job.heartbeat_at = Some(at);
                }
                Ok(())
            })?;
            stamped += 1;
        }
        Ok(stamped)
    }

    /// Deletes finished jobs last touched before `cutoff`; returns how many.
    fn reap_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut reaped = 0;
        for job in self.list()? {
            if job.is_finished() && job.updated_at < cutoff && self.delete(&job.id)? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}
