use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::config::{Config, DeclaredType, JobBackend};
use crate::db::{Database, Document, DocumentId, DocumentStore, SqliteDocumentStore};
use crate::error::{ExtractionFailure, IngestError, Result, ScanError, StoreError};
use crate::jobs::{Job, JobId, JobKind, JobMutation, JobStore, MemoryJobStore, SqliteJobStore};
use crate::processor::ExtractorRegistry;
use crate::sanitize;
use crate::search::{SearchQuery, SearchResults};
use crate::settings::{DocumentsDir, JsonFileSettings, SettingsStore};
use crate::storage::{safe_filename, save_upload, TextOutput};
use crate::worker::{DirectoryScanner, FileCandidate, Task, WorkerPool};

use super::heartbeat::{Heartbeat, HEARTBEAT_INTERVAL, ORPHAN_AFTER};
use super::runner::{IngestSource, TaskProcessor};

/// Failure reason for orphaned jobs, whose process stopped before they
/// finished.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// Components an [`Ingestor`] is assembled from.
pub struct IngestorParts {
    pub config: Config,
    pub settings: Arc<dyn SettingsStore>,
    pub jobs: Arc<dyn JobStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub extractors: Arc<ExtractorRegistry>,
}

/// Entry point for every ingestion operation: single uploads, upload
/// batches and directory batches, plus job polling, settings and search.
pub struct Ingestor {
    config: Config,
    settings: Arc<dyn SettingsStore>,
    jobs: Arc<dyn JobStore>,
    documents: Arc<dyn DocumentStore>,
    processor: Arc<TaskProcessor>,
    pool: WorkerPool,
    instance_id: String,
    heartbeat: Heartbeat,
}

impl Ingestor {
    /// Production wiring: SQLite in the data directory, `settings.json`,
    /// Tesseract and pdftoppm.
    ///
    /// Opening never touches existing jobs, so short-lived readers can share
    /// the job store with a running ingestor. Call
    /// [`Ingestor::recover_interrupted`] and [`Ingestor::reap_jobs`] from
    /// the process that runs batches.
    pub fn open(config: Config) -> Result<Self> {
        let db = Database::open(&config.database_path())?;
        let settings: Arc<dyn SettingsStore> =
            Arc::new(JsonFileSettings::open(config.settings_path())?);

        let jobs: Arc<dyn JobStore> = match config.jobs.backend {
            JobBackend::Memory => Arc::new(MemoryJobStore::new()),
            JobBackend::Sqlite => Arc::new(SqliteJobStore::new(db.clone())),
        };
        let documents: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::new(
            db,
            config.search.similarity_threshold,
        ));
        let extractors = Arc::new(ExtractorRegistry::from_config(&config.ocr));

        Self::with_parts(IngestorParts {
            config,
            settings,
            jobs,
            documents,
            extractors,
        })
    }

    /// Assembles an ingestor from injected parts and starts its workers.
    pub fn with_parts(parts: IngestorParts) -> Result<Self> {
        let IngestorParts {
            config,
            settings,
            jobs,
            documents,
            extractors,
        } = parts;

        DocumentsDir::initialize(settings.as_ref(), &config.default_documents_dir())?;

        let processor = Arc::new(
            TaskProcessor::new(extractors, Arc::clone(&documents), Arc::clone(&jobs))
                .with_text_output(config.text_output_directory().map(TextOutput::new)),
        );
        let pool = WorkerPool::new(
            processor.clone(),
            config.worker_count,
            config.queue_capacity(),
        )?;
        let instance_id = uuid::Uuid::new_v4().simple().to_string();
        let heartbeat = Heartbeat::start(Arc::clone(&jobs), instance_id.clone(), HEARTBEAT_INTERVAL)?;

        Ok(Self {
            config,
            settings,
            jobs,
            documents,
            processor,
            pool,
            instance_id,
            heartbeat,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Owner stamp on every job this ingestor creates.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Ingests one uploaded file synchronously on the caller's thread.
    pub fn ingest_one(&self, name: &str, bytes: &[u8]) -> Result<Document> {
        let _span = tracing::info_span!("orchestrator.ingest_one", file = %safe_filename(name))
            .entered();

        let declared_type = declared_type_of(name)?;
        let source_path = self.upload_source_path(name, bytes)?;
        let source = IngestSource {
            source_path,
            name: safe_filename(name),
            declared_type,
            mime_type: mime_guess::from_path(name).first().map(|m| m.to_string()),
            modified: None,
        };

        let id = self.processor.ingest_bytes(&source, bytes)?;
        self.documents
            .get(id)?
            .ok_or(IngestError::DocumentMissing(id))
    }

    /// Queues several uploaded files as one job and returns its id at once.
    pub fn ingest_uploads(&self, files: Vec<(String, Vec<u8>)>) -> Result<JobId> {
        let names: Vec<String> = files.iter().map(|(name, _)| safe_filename(name)).collect();
        let job = Job::new(JobKind::Upload, names.join(", "), files.len())
            .with_owner(&self.instance_id)
            .with_result_limit(self.config.jobs.result_list_limit);
        let job_id = job.id.clone();
        self.jobs.create(job)?;
        info!("Upload job {} queued with {} files", job_id, files.len());

        for (name, bytes) in files {
            let prepared = declared_type_of(&name)
                .and_then(|declared| Ok((declared, self.upload_source_path(&name, &bytes)?)));
            match prepared {
                Ok((declared_type, source_path)) => {
                    let task = Task::upload(
                        job_id.clone(),
                        safe_filename(&name),
                        source_path,
                        declared_type,
                        bytes,
                    );
                    if let Err(e) = self.pool.submit(task) {
                        warn!("Upload job {}: {}", job_id, e);
                    }
                }
                Err(e) => self.record_failure(&job_id, &name, &e),
            }
        }

        Ok(job_id)
    }

    /// Scans `root` and queues every supported file as one batch job.
    ///
    /// The scan is drained before the job exists, so the returned job
    /// already carries its final total. A root that cannot be walked yields
    /// a `failed` job and [`IngestError::BatchRejected`].
    pub fn ingest_batch(&self, root: &Path, recursive: bool) -> Result<JobId> {
        let _span = tracing::info_span!(
            "orchestrator.ingest_batch",
            root = %sanitize::redact_path(root),
            root_hash = %sanitize::hash_path(root),
            recursive
        )
        .entered();

        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let source = root.to_string_lossy().into_owned();

        let (candidates, warnings) = match DirectoryScanner::new(&root, recursive).scan_all() {
            Ok(scan) => scan,
            Err(e) => {
                let job = Job::rejected(JobKind::Batch, source, e.to_string())
                    .with_owner(&self.instance_id)
                    .with_recursive(recursive);
                let job_id = job.id.clone();
                self.jobs.create(job)?;
                error!("Batch job {} rejected: {}", job_id, e);
                return Err(IngestError::BatchRejected { job_id, source: e });
            }
        };

        self.submit_batch(JobKind::Batch, source, recursive, candidates, &warnings, Vec::new())
    }

    /// Runs [`Ingestor::ingest_batch`] over the configured documents directory.
    pub fn ingest_documents_dir(&self, recursive: bool) -> Result<JobId> {
        let root = DocumentsDir::get(self.settings.as_ref())?;
        self.ingest_batch(&root, recursive)
    }

    fn submit_batch(
        &self,
        kind: JobKind,
        source: String,
        recursive: bool,
        candidates: Vec<FileCandidate>,
        warnings: &[ScanError],
        missing: Vec<(String, String)>,
    ) -> Result<JobId> {
        let job = Job::new(kind, source, candidates.len() + missing.len())
            .with_owner(&self.instance_id)
            .with_recursive(recursive)
            .with_result_limit(self.config.jobs.result_list_limit);
        let job_id = job.id.clone();
        self.jobs.create(job)?;
        info!(
            "Batch job {} queued with {} files ({} scan warnings)",
            job_id,
            candidates.len(),
            warnings.len()
        );

        for (item, reason) in missing {
            self.record(&job_id, JobMutation::RecordFailure { item, reason });
        }

        let mut rejected = 0;
        for candidate in candidates {
            if self.pool.submit(Task::file(job_id.clone(), candidate)).is_err() {
                rejected += 1;
            }
        }
        if rejected > 0 {
            warn!(
                "Batch job {}: {} files not queued because the pool is shutting down",
                job_id, rejected
            );
        }

        Ok(job_id)
    }

    /// Returns a snapshot of a job.
    pub fn poll_status(&self, job_id: &str) -> Result<Job> {
        Ok(self.jobs.get(job_id)?)
    }

    /// All known jobs, newest first.
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.list()?)
    }

    pub fn delete_job(&self, job_id: &str) -> Result<bool> {
        Ok(self.jobs.delete(job_id)?)
    }

    /// Queues the failed items of a finished job as a new job of the same
    /// kind. Batch items are retried from their paths; upload items only
    /// when the originals were kept in the uploads directory.
    pub fn retry_failed(&self, job_id: &str) -> Result<JobId> {
        let job = self.jobs.get(job_id)?;
        if !job.is_finished() {
            return Err(IngestError::JobNotFinished(job.id));
        }

        let paths: Vec<PathBuf> = match job.kind {
            JobKind::Batch => job
                .failures
                .iter()
                .map(|f| PathBuf::from(&f.item))
                .collect(),
            JobKind::Upload => match self.config.uploads_directory() {
                Some(dir) => job
                    .failures
                    .iter()
                    .map(|f| dir.join(safe_filename(&f.item)))
                    .collect(),
                None => Vec::new(),
            },
        };
        if paths.is_empty() {
            return Err(IngestError::NothingToRetry(job.id));
        }

        let mut candidates = Vec::new();
        let mut missing = Vec::new();
        for path in paths {
            match FileCandidate::from_path(&path) {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => missing.push((path.to_string_lossy().into_owned(), e.to_string())),
            }
        }

        info!(
            "Retrying {} failed items of job {}",
            candidates.len() + missing.len(),
            job.id
        );
        self.submit_batch(job.kind, job.source, job.recursive, candidates, &[], missing)
    }

    /// Fails orphaned jobs and queues a fresh batch over the root of each
    /// orphaned batch job; returns the new job ids.
    ///
    /// A job is orphaned when it is unfinished, owned by another ingestor
    /// and has shown neither progress nor a heartbeat for [`ORPHAN_AFTER`].
    /// Jobs of a live ingestor sharing the store are left alone. Upload
    /// bytes do not outlive their process, so orphaned upload jobs are only
    /// failed.
    pub fn recover_interrupted(&self) -> Result<Vec<JobId>> {
        let silence = chrono::Duration::seconds(ORPHAN_AFTER.as_secs() as i64);
        self.recover_orphaned(Utc::now() - silence)
    }

    fn recover_orphaned(&self, cutoff: chrono::DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut resubmitted = Vec::new();
        for job in self.jobs.unfinished()? {
            if !job.is_orphaned(&self.instance_id, cutoff) {
                continue;
            }

            // Re-check inside the update: the owner may have finished the
            // job or stamped a heartbeat since the listing.
            let mut claimed = false;
            let outcome = self.jobs.update(&job.id, &mut |current| {
                claimed = current.is_orphaned(&self.instance_id, cutoff);
                if claimed {
                    current.apply(JobMutation::Fail {
                        reason: INTERRUPTED_BY_RESTART.to_string(),
                    })?;
                }
                Ok(())
            });
            match outcome {
                Ok(_) => {}
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
            if !claimed {
                debug!("Job {} came back to life, leaving it", job.id);
                continue;
            }
            warn!(
                "Job {} was {} when its process stopped",
                job.id, job.state
            );

            if job.kind == JobKind::Batch {
                match self.ingest_batch(Path::new(&job.source), job.recursive) {
                    Ok(new_id) => resubmitted.push(new_id),
                    Err(e) => warn!("Could not resubmit job {}: {}", job.id, e),
                }
            }
        }
        Ok(resubmitted)
    }

    /// Deletes finished jobs older than the configured retention.
    pub fn reap_jobs(&self) -> Result<usize> {
        let retention = chrono::Duration::hours(self.config.jobs.retention_hours as i64);
        Ok(self.jobs.reap_finished_before(Utc::now() - retention)?)
    }

    pub fn documents_dir(&self) -> Result<PathBuf> {
        Ok(DocumentsDir::get(self.settings.as_ref())?)
    }

    /// Validates and persists a new documents directory.
    pub fn set_documents_dir(&self, path: &Path) -> Result<PathBuf> {
        Ok(DocumentsDir::set(self.settings.as_ref(), path)?)
    }

    /// Ranked search; `limit` falls back to the configured page size.
    pub fn search(&self, term: &str, limit: Option<usize>, offset: usize) -> Result<SearchResults> {
        let limit = limit.unwrap_or(self.config.search.default_limit).max(1);
        Ok(self
            .documents
            .search(&SearchQuery::new(term, limit, offset))?)
    }

    pub fn document(&self, id: DocumentId) -> Result<Option<Document>> {
        Ok(self.documents.get(id)?)
    }

    /// Rejects new work, lets running tasks finish, records queued tasks
    /// as discarded and joins the workers.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.pool.wait();
        self.heartbeat.stop();
    }

    /// Where an upload's document lives: the saved original when an uploads
    /// directory is configured, otherwise a stable `upload://` key.
    fn upload_source_path(&self, name: &str, bytes: &[u8]) -> Result<String> {
        match self.config.uploads_directory() {
            Some(dir) => {
                let path = save_upload(&dir, name, bytes)?;
                Ok(path.to_string_lossy().into_owned())
            }
            None => Ok(format!("upload://{}", safe_filename(name))),
        }
    }

    fn record_failure(&self, job_id: &str, name: &str, err: &IngestError) {
        let reason = match err {
            IngestError::Extraction { failure, .. } => failure.to_string(),
            other => other.to_string(),
        };
        self.record(
            job_id,
            JobMutation::RecordFailure {
                item: name.to_string(),
                reason,
            },
        );
    }

    fn record(&self, job_id: &str, mutation: JobMutation) {
        if let Err(e) = self.jobs.apply(job_id, mutation) {
            error!("Failed to update job {}: {}", job_id, e);
        }
    }
}

fn declared_type_of(name: &str) -> Result<DeclaredType> {
    DeclaredType::from_path(Path::new(name)).ok_or_else(|| IngestError::Extraction {
        name: name.to_string(),
        failure: ExtractionFailure::Unsupported {
            reason: format!(
                "unsupported file extension (expected one of {})",
                DeclaredType::SUPPORTED_EXTENSIONS.join(", ")
            ),
        },
    })
}
