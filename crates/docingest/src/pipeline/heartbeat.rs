//! Liveness stamps on the jobs an ingestor owns, so another process
//! sharing the job store can tell a live job from one left behind by a
//! crash.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::error::WorkerError;
use crate::jobs::JobStore;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// How long an unfinished job may go without progress or a heartbeat
/// before another ingestor may treat it as orphaned.
pub const ORPHAN_AFTER: Duration = Duration::from_secs(60);

pub struct Heartbeat {
    running: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl Heartbeat {
    pub fn start(
        jobs: Arc<dyn JobStore>,
        owner: String,
        interval: Duration,
    ) -> Result<Self, WorkerError> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("docingest-heartbeat".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match jobs.heartbeat(&owner, Utc::now()) {
                        Ok(0) => {}
                        Ok(n) => debug!("Heartbeat for {} running jobs", n),
                        Err(e) => warn!("Could not stamp job heartbeat: {}", e),
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        Ok(Self {
            running: Mutex::new(Some((stop_tx, handle))),
        })
    }

    /// Stops the stamping thread. Safe to call more than once.
    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some((stop_tx, handle)) = running {
            drop(stop_tx);
            if handle.join().is_err() {
                warn!("Heartbeat thread panicked");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, JobKind, MemoryJobStore};

    #[test]
    fn test_stamps_owned_jobs_until_stopped() {
        let jobs = Arc::new(MemoryJobStore::new());
        let job = Job::new(JobKind::Batch, "/scans", 3).with_owner("me");
        let id = job.id.clone();
        jobs.create(job).unwrap();

        let heartbeat =
            Heartbeat::start(jobs.clone(), "me".to_string(), Duration::from_millis(10)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while jobs.get(&id).unwrap().heartbeat_at.is_none() {
            assert!(std::time::Instant::now() < deadline, "no heartbeat stamped");
            thread::sleep(Duration::from_millis(5));
        }

        heartbeat.stop();
        let stamped = jobs.get(&id).unwrap().heartbeat_at;
        thread::sleep(Duration::from_millis(50));
        assert_eq!(jobs.get(&id).unwrap().heartbeat_at, stamped);
        heartbeat.stop();
    }
}
