use std::fmt;

use crate::config::DeclaredType;
use crate::jobs::JobId;
use crate::worker::scanner::FileCandidate;

/// One file of a job, queued for a worker.
#[derive(Debug, Clone)]
pub struct Task {
    pub job_id: JobId,
    pub source: TaskSource,
}

#[derive(Clone)]
pub enum TaskSource {
    /// A file found by the scanner; its bytes are read by the worker.
    File(FileCandidate),
    /// Bytes received from a client.
    Upload {
        name: String,
        /// Identity of the resulting document.
        source_path: String,
        declared_type: DeclaredType,
        bytes: Vec<u8>,
    },
}

impl fmt::Debug for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskSource::File(candidate) => f.debug_tuple("File").field(&candidate.path).finish(),
            TaskSource::Upload {
                name,
                declared_type,
                bytes,
                ..
            } => f
                .debug_struct("Upload")
                .field("name", name)
                .field("declared_type", declared_type)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

impl Task {
    pub fn file(job_id: impl Into<JobId>, candidate: FileCandidate) -> Self {
        Self {
            job_id: job_id.into(),
            source: TaskSource::File(candidate),
        }
    }

    pub fn upload(
        job_id: impl Into<JobId>,
        name: impl Into<String>,
        source_path: impl Into<String>,
        declared_type: DeclaredType,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            source: TaskSource::Upload {
                name: name.into(),
                source_path: source_path.into(),
                declared_type,
                bytes,
            },
        }
    }

    /// How the item appears in job failure records: the full path for
    /// scanned files, the client name for uploads.
    pub fn item(&self) -> String {
        match &self.source {
            TaskSource::File(candidate) => candidate.path.to_string_lossy().into_owned(),
            TaskSource::Upload { name, .. } => name.clone(),
        }
    }

    pub fn file_name(&self) -> String {
        match &self.source {
            TaskSource::File(candidate) => candidate.file_name(),
            TaskSource::Upload { name, .. } => name.clone(),
        }
    }

    pub fn declared_type(&self) -> DeclaredType {
        match &self.source {
            TaskSource::File(candidate) => candidate.declared_type,
            TaskSource::Upload { declared_type, .. } => *declared_type,
        }
    }
}
