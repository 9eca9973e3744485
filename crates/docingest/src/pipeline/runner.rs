use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info_span, warn};

use crate::config::DeclaredType;
use crate::db::{DatabaseError, DocumentId, DocumentStore, NewDocument};
use crate::error::{ExtractionFailure, IngestError};
use crate::jobs::{JobMutation, JobStore};
use crate::processor::{ExtractionMetadata, ExtractorRegistry};
use crate::sanitize;
use crate::storage::TextOutput;
use crate::worker::{Task, TaskHandler, TaskSource};

const UPSERT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Identity of the bytes being ingested.
#[derive(Debug, Clone)]
pub struct IngestSource {
    /// Document identity; re-ingesting the same source replaces it.
    pub source_path: String,
    /// Client-facing file name, used for the document and sidecar names.
    pub name: String,
    pub declared_type: DeclaredType,
    pub mime_type: Option<String>,
    pub modified: Option<DateTime<Utc>>,
}

/// Runs one file through extraction and persistence, and records the
/// outcome on its job.
pub struct TaskProcessor {
    extractors: Arc<ExtractorRegistry>,
    documents: Arc<dyn DocumentStore>,
    jobs: Arc<dyn JobStore>,
    text_output: Option<TextOutput>,
}

impl TaskProcessor {
    pub fn new(
        extractors: Arc<ExtractorRegistry>,
        documents: Arc<dyn DocumentStore>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            extractors,
            documents,
            jobs,
            text_output: None,
        }
    }

    pub fn with_text_output(mut self, text_output: Option<TextOutput>) -> Self {
        self.text_output = text_output;
        self
    }

    /// Extracts and stores one document.
    ///
    /// A failed extraction still stores a `failed` document carrying the
    /// reason, then returns [`IngestError::Extraction`], or
    /// [`IngestError::FailureNotStored`] when that document could not be
    /// stored either. Every upsert is retried once.
    pub fn ingest_bytes(
        &self,
        source: &IngestSource,
        bytes: &[u8],
    ) -> Result<DocumentId, IngestError> {
        let result = self.extractors.extract(bytes, source.declared_type);

        if !result.is_success() {
            let failure = result.error.clone().unwrap_or(ExtractionFailure::Corrupt {
                reason: format!("extraction ended as {:?}", result.status),
            });
            warn!("Extraction failed for {}: {}", source.name, failure);

            let failed = NewDocument::failed(
                &source.source_path,
                &source.name,
                source.declared_type,
                failure.to_string(),
            )
            .with_mime_type(source.mime_type.clone())
            .with_size(bytes.len() as u64)
            .with_metadata(document_metadata(source, bytes.len(), &result.metadata));
            return Err(match self.upsert_with_retry(&failed) {
                Ok(_) => IngestError::Extraction {
                    name: source.name.clone(),
                    failure,
                },
                Err(e) => IngestError::FailureNotStored {
                    name: source.name.clone(),
                    failure,
                    source: e,
                },
            });
        }

        let metadata = document_metadata(source, bytes.len(), &result.metadata);
        let doc = NewDocument::indexed(
            &source.source_path,
            &source.name,
            source.declared_type,
            result.text.as_str(),
        )
        .with_mime_type(source.mime_type.clone())
        .with_size(bytes.len() as u64)
        .with_metadata(metadata);

        let id = self.upsert_with_retry(&doc)?;

        if let Some(output) = &self.text_output {
            match output.write(&source.name, &result.text) {
                Ok(path) => debug!("Wrote text sidecar {}", sanitize::redact_path(&path)),
                Err(e) => warn!("Could not write text sidecar for {}: {}", source.name, e),
            }
        }

        Ok(id)
    }

    fn upsert_with_retry(&self, doc: &NewDocument) -> Result<DocumentId, DatabaseError> {
        match self.documents.upsert(doc) {
            Ok(id) => Ok(id),
            Err(first) => {
                warn!("Storing {} failed, retrying once: {}", doc.filename, first);
                std::thread::sleep(UPSERT_RETRY_DELAY);
                self.documents.upsert(doc).map_err(|e| {
                    error!("Storing {} failed after retry: {}", doc.filename, e);
                    e
                })
            }
        }
    }

    /// Runs a queued task to completion. Every outcome, including a read
    /// error, ends in exactly one record on the task's job.
    pub fn process(&self, task: &Task) {
        let file_name = task.file_name();
        let _span = info_span!(
            "pipeline.task",
            job_id = %task.job_id,
            file = %file_name,
            declared = %task.declared_type(),
        )
        .entered();

        self.record(&task.job_id, JobMutation::MarkRunning);

        let outcome = match &task.source {
            TaskSource::File(candidate) => match std::fs::read(&candidate.path) {
                Ok(bytes) => {
                    let source = IngestSource {
                        source_path: candidate.path.to_string_lossy().into_owned(),
                        name: file_name.clone(),
                        declared_type: candidate.declared_type,
                        mime_type: Some(candidate.mime_type.clone()),
                        modified: candidate.modified,
                    };
                    self.ingest_bytes(&source, &bytes)
                }
                Err(e) => Err(IngestError::Extraction {
                    name: file_name.clone(),
                    failure: ExtractionFailure::Read {
                        path: candidate.path.to_string_lossy().into_owned(),
                        reason: e.to_string(),
                    },
                }),
            },
            TaskSource::Upload {
                name,
                source_path,
                declared_type,
                bytes,
            } => {
                let source = IngestSource {
                    source_path: source_path.clone(),
                    name: name.clone(),
                    declared_type: *declared_type,
                    mime_type: mime_guess::from_path(name).first().map(|m| m.to_string()),
                    modified: None,
                };
                self.ingest_bytes(&source, bytes)
            }
        };

        let mutation = match outcome {
            Ok(document_id) => {
                debug!("Indexed {} as document {}", file_name, document_id);
                JobMutation::RecordSuccess { document_id }
            }
            Err(IngestError::Extraction { failure, .. }) => JobMutation::RecordFailure {
                item: task.item(),
                reason: failure.to_string(),
            },
            Err(IngestError::FailureNotStored {
                failure, source, ..
            }) => JobMutation::RecordFailure {
                item: task.item(),
                reason: format!("{}; not stored: {}", failure, source),
            },
            Err(e) => {
                error!("Ingesting {} failed: {}", file_name, e);
                JobMutation::RecordFailure {
                    item: task.item(),
                    reason: e.to_string(),
                }
            }
        };
        self.record(&task.job_id, mutation);
    }

    /// Job store failures are logged and never propagate into a worker.
    fn record(&self, job_id: &str, mutation: JobMutation) {
        if let Err(e) = self.jobs.apply(job_id, mutation) {
            error!("Failed to update job {}: {}", job_id, e);
        }
    }
}

impl TaskHandler for TaskProcessor {
    fn handle(&self, task: &Task) {
        self.process(task);
    }

    fn discard(&self, task: &Task, reason: &str) {
        self.record(
            &task.job_id,
            JobMutation::RecordFailure {
                item: task.item(),
                reason: reason.to_string(),
            },
        );
    }
}

/// Extraction metadata plus a `file` section describing the source.
fn document_metadata(
    source: &IngestSource,
    size: usize,
    extracted: &ExtractionMetadata,
) -> serde_json::Value {
    let mut metadata = match serde_json::to_value(extracted) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) => serde_json::Map::new(),
        Err(e) => {
            warn!("Dropping unserializable metadata for {}: {}", source.name, e);
            serde_json::Map::new()
        }
    };
    let extension = Path::new(&source.name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase());
    metadata.insert(
        "file".to_string(),
        json!({
            "name": source.name,
            "size": size,
            "mime_type": source.mime_type,
            "extension": extension,
            "modified": source.modified.map(|t| t.to_rfc3339()),
        }),
    );
    serde_json::Value::Object(metadata)
}
