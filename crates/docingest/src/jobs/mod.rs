//! Job records and the stores that share them between the orchestrator,
//! the workers and pollers.

pub mod job;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use job::{ItemFailure, Job, JobId, JobKind, JobMutation, JobState};
pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use store::JobStore;
