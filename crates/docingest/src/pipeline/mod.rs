pub mod heartbeat;
pub mod orchestrator;
pub mod runner;

pub use heartbeat::{HEARTBEAT_INTERVAL, ORPHAN_AFTER};
pub use orchestrator::{Ingestor, IngestorParts, INTERRUPTED_BY_RESTART};
pub use runner::{IngestSource, TaskProcessor};
