pub mod pool;
pub mod scanner;
pub mod task;

pub use pool::{TaskHandler, WorkerPool, DISCARDED_ON_SHUTDOWN};
pub use scanner::{DirectoryScanner, FileCandidate};
pub use task::{Task, TaskSource};
