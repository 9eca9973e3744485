pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod pipeline;
pub mod processor;
pub mod sanitize;
pub mod search;
pub mod settings;
pub mod storage;
pub mod worker;

pub use config::{load_config, load_config_from_str, Config, DeclaredType};
pub use db::{Database, Document, DocumentId, DocumentStore, SqliteDocumentStore};
pub use error::{
    ConfigError, ExtractionFailure, IngestError, Result, ScanError, SettingsError, StoreError,
    WorkerError,
};
pub use jobs::{Job, JobId, JobKind, JobState, JobStore, MemoryJobStore, SqliteJobStore};
pub use logging::LogFormat;
pub use pipeline::{Ingestor, IngestorParts};
pub use processor::{ExtractionResult, ExtractorRegistry, OcrEngine, PdfRasterizer};
pub use search::{MatchKind, SearchHit, SearchResults};
pub use settings::{DocumentsDir, JsonFileSettings, MemorySettings, SettingsStore};
