use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::{debug, error, info};

use crate::error::WorkerError;
use crate::worker::task::Task;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Failure reason recorded for tasks dropped by [`WorkerPool::shutdown`].
pub const DISCARDED_ON_SHUTDOWN: &str = "discarded: worker pool shut down";

/// What workers do with a task.
pub trait TaskHandler: Send + Sync {
    /// Runs the task to completion, recording its outcome on its job.
    fn handle(&self, task: &Task);

    /// Records the task as failed without running it.
    fn discard(&self, task: &Task, reason: &str);
}

/// A fixed set of worker threads fed by a bounded queue.
///
/// At most `worker_count` tasks run at once. `submit` blocks while the
/// queue is full, which throttles producers to the workers' pace.
pub struct WorkerPool {
    sender: RwLock<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
    handler: Arc<dyn TaskHandler>,
    worker_count: usize,
}

impl WorkerPool {
    pub fn new(
        handler: Arc<dyn TaskHandler>,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker_count must be at least 1".to_string(),
            ));
        }
        let (sender, receiver) = bounded::<Task>(queue_capacity.max(1));
        let closing = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let rx = receiver.clone();
            let closing_flag = Arc::clone(&closing);
            let worker_handler = Arc::clone(&handler);

            let handle = thread::Builder::new()
                .name(format!("docingest-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, rx, closing_flag, worker_handler))
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!(
            "Started {} workers (queue capacity {})",
            worker_count,
            queue_capacity.max(1)
        );

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
            closing,
            handler,
            worker_count,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queues a task, blocking while the queue is full.
    ///
    /// A task that cannot be queued because the pool is shutting down is
    /// recorded as a failure on its job before the error is returned.
    pub fn submit(&self, task: Task) -> Result<(), WorkerError> {
        let guard = self.sender.read().unwrap_or_else(|poisoned| {
            log::warn!("Worker pool sender lock poisoned, recovering");
            poisoned.into_inner()
        });
        let Some(sender) = guard.as_ref() else {
            drop(guard);
            self.handler.discard(&task, DISCARDED_ON_SHUTDOWN);
            return Err(WorkerError::ShuttingDown);
        };

        let mut task = task;
        loop {
            if self.closing.load(Ordering::SeqCst) {
                drop(guard);
                self.handler.discard(&task, DISCARDED_ON_SHUTDOWN);
                return Err(WorkerError::ShuttingDown);
            }
            match sender.send_timeout(task, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => task = returned,
                Err(SendTimeoutError::Disconnected(returned)) => {
                    drop(guard);
                    self.handler.discard(&returned, DISCARDED_ON_SHUTDOWN);
                    return Err(WorkerError::ChannelClosed);
                }
            }
        }
    }

    /// Stops accepting tasks. Workers finish the task they are running;
    /// tasks still queued are discarded and recorded as failures.
    pub fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down worker pool...");
        // Blocked submitters notice `closing` within one poll interval and
        // release the read lock.
        let mut sender = self.sender.write().unwrap_or_else(|p| p.into_inner());
        sender.take();
    }

    pub fn is_shutdown(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Joins every worker. Returns once the queue is drained, so call
    /// [`WorkerPool::shutdown`] first.
    pub fn wait(&self) {
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };

        for (i, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

/// Workers exit only once every sender is gone, so a task queued at any
/// point is either run or discarded, never lost.
fn run_worker(
    worker_id: usize,
    receiver: Receiver<Task>,
    closing: Arc<AtomicBool>,
    handler: Arc<dyn TaskHandler>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(task) => {
                if closing.load(Ordering::SeqCst) {
                    debug!("Worker {} discarding task for job {}", worker_id, task.job_id);
                    handler.discard(&task, DISCARDED_ON_SHUTDOWN);
                    continue;
                }

                debug!("Worker {} processing {}", worker_id, task.file_name());
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&task)))
                {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("Worker {} panicked on job {}: {}", worker_id, task.job_id, message);
                    handler.discard(&task, &format!("worker panicked: {}", message));
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Worker {} job channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
