use std::path::PathBuf;
use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Batch job {job_id} could not be constructed: {source}")]
    BatchRejected {
        job_id: String,
        #[source]
        source: ScanError,
    },

    #[error("Extraction failed for '{name}': {failure}")]
    Extraction {
        name: String,
        failure: ExtractionFailure,
    },

    #[error("Extraction failed for '{name}': {failure}; the failed document was not stored: {source}")]
    FailureNotStored {
        name: String,
        failure: ExtractionFailure,
        #[source]
        source: DatabaseError,
    },

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job {0} is still running")]
    JobNotFinished(String),

    #[error("Job {0} has no failed items that can be retried")]
    NothingToRetry(String),

    #[error("Document {0} vanished after it was stored")]
    DocumentMissing(i64),

    #[error("Persistence error: {0}")]
    Persistence(#[from] DatabaseError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to access settings file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Settings file '{path}' is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid documents directory '{path}': {reason}")]
    InvalidDocumentsDir { path: PathBuf, reason: String },

    #[error("Setting '{0}' has no value")]
    Missing(String),
}

/// Problems met while walking a scan root.
///
/// Only [`ScanError::RootUnreadable`] and [`ScanError::NotADirectory`] stop a
/// scan; the other variants are warnings and the walk continues.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Cannot read scan root '{path}': {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Scan root '{0}' is not a directory")]
    NotADirectory(PathBuf),

    #[error("Skipping unreadable entry '{path}': {reason}")]
    Entry { path: PathBuf, reason: String },

    #[error("Skipping symlink loop at '{path}' (points back to '{ancestor}')")]
    Loop { path: PathBuf, ancestor: PathBuf },
}

impl ScanError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScanError::RootUnreadable { .. } | ScanError::NotADirectory(_)
        )
    }
}

/// Why a single file produced no usable text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionFailure {
    #[error("input is empty")]
    Empty,

    #[error("declared type '{declared}' does not match content ({detected})")]
    TypeMismatch { declared: String, detected: String },

    #[error("unsupported content: {reason}")]
    Unsupported { reason: String },

    #[error("corrupt or unreadable content: {reason}")]
    Corrupt { reason: String },

    #[error("{engine} engine unavailable: {reason}")]
    EngineUnavailable { engine: String, reason: String },

    #[error("OCR failed: {reason}")]
    OcrFailed { reason: String },

    #[error("all {count} units failed, first: {first}")]
    AllUnitsFailed { count: usize, first: String },

    #[error("failed to read '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("extractor panicked: {0}")]
    Panicked(String),
}

impl ExtractionFailure {
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, ExtractionFailure::EngineUnavailable { .. })
    }
}

/// Errors reported by the OCR engine and the PDF rasterizer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error("Job {job_id} rejected update: {reason}")]
    InvariantViolation { job_id: String, reason: String },

    #[error("Job store backend error: {0}")]
    Backend(#[from] DatabaseError),

    #[error("Failed to encode job record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(DatabaseError::Sqlite(e))
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No free file name for '{name}' in '{directory}'")]
    NameExhausted { directory: PathBuf, name: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,
}

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Failed to install log subscriber: {0}")]
    Install(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
