#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use docingest::db::{DatabaseError, NewDocument};
use docingest::error::EngineError;
use docingest::processor::pdf::PdfOptions;
use docingest::processor::UnavailableEngine;
use docingest::search::SearchQuery;
use docingest::{
    Config, Database, Document, DocumentId, DocumentStore, ExtractorRegistry, Ingestor,
    IngestorParts, Job, JobStore, MemoryJobStore, MemorySettings, OcrEngine, PdfRasterizer,
    SearchResults, SettingsStore, SqliteDocumentStore,
};
use tempfile::TempDir;

const JOB_TIMEOUT: Duration = Duration::from_secs(10);

/// OCR engine that "recognizes" the marker a [`FakeRasterizer`] renders,
/// and a fixed sentence for any other image.
pub struct FakeOcr {
    pub calls: AtomicUsize,
}

impl FakeOcr {
    pub const IMAGE_TEXT: &'static str = "Scanned receipt from the hardware store";

    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl OcrEngine for FakeOcr {
    fn recognize(&self, image: &[u8]) -> Result<String, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match image.strip_prefix(b"render:") {
            Some(marker) => Ok(format!("Recognized {}", String::from_utf8_lossy(marker))),
            None => Ok(Self::IMAGE_TEXT.to_string()),
        }
    }
}

/// Renders page `n` (zero-based) as the bytes `render:page-{n+1}`. Pages
/// listed in `failing` report a render error.
pub struct FakeRasterizer {
    pub failing: Vec<usize>,
}

impl PdfRasterizer for FakeRasterizer {
    fn render(&self, _pdf: &[u8], page_index: usize) -> Result<Vec<u8>, EngineError> {
        if self.failing.contains(&page_index) {
            return Err(EngineError::Failed(format!(
                "could not render page {}",
                page_index + 1
            )));
        }
        Ok(format!("render:page-{}", page_index + 1).into_bytes())
    }

    fn page_count(&self, _pdf: &[u8]) -> Result<usize, EngineError> {
        Err(EngineError::Unavailable("no page counter in tests".to_string()))
    }
}

/// Document store whose first `failing` upserts report a storage error
/// before reaching the real store.
pub struct FlakyDocuments {
    inner: SqliteDocumentStore,
    failing: AtomicUsize,
    pub upserts: AtomicUsize,
}

impl FlakyDocuments {
    pub fn new(inner: SqliteDocumentStore, failing: usize) -> Self {
        Self {
            inner,
            failing: AtomicUsize::new(failing),
            upserts: AtomicUsize::new(0),
        }
    }
}

impl DocumentStore for FlakyDocuments {
    fn upsert(&self, doc: &NewDocument) -> Result<DocumentId, DatabaseError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail {
            return Err(DatabaseError::Io {
                path: PathBuf::from("documents.db"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk unavailable"),
            });
        }
        self.inner.upsert(doc)
    }

    fn get(&self, id: DocumentId) -> Result<Option<Document>, DatabaseError> {
        self.inner.get(id)
    }

    fn find_by_source(&self, source_path: &str) -> Result<Option<Document>, DatabaseError> {
        self.inner.find_by_source(source_path)
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchResults, DatabaseError> {
        self.inner.search(query)
    }

    fn count(&self) -> Result<u64, DatabaseError> {
        self.inner.count()
    }
}

pub struct HarnessBuilder {
    worker_count: usize,
    queue_capacity: Option<usize>,
    ocr_available: bool,
    failing_pages: Vec<usize>,
    extractors: Option<ExtractorRegistry>,
    text_output: bool,
    uploads: bool,
    failing_upserts: Option<usize>,
}

impl HarnessBuilder {
    pub fn workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn ocr_unavailable(mut self) -> Self {
        self.ocr_available = false;
        self
    }

    pub fn failing_pages(mut self, pages: &[usize]) -> Self {
        self.failing_pages = pages.to_vec();
        self
    }

    /// Replaces the standard extractors entirely.
    pub fn extractors(mut self, registry: ExtractorRegistry) -> Self {
        self.extractors = Some(registry);
        self
    }

    pub fn text_output(mut self) -> Self {
        self.text_output = true;
        self
    }

    pub fn keep_uploads(mut self) -> Self {
        self.uploads = true;
        self
    }

    /// Stores documents through a [`FlakyDocuments`] failing its first
    /// `count` upserts.
    pub fn failing_upserts(mut self, count: usize) -> Self {
        self.failing_upserts = Some(count);
        self
    }

    pub fn build(self) -> TestHarness {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let docs_dir = temp_dir.path().join("documents");
        std::fs::create_dir_all(&docs_dir).expect("Failed to create documents dir");

        let config = Config {
            documents_dir: Some(docs_dir.to_string_lossy().into_owned()),
            data_directory: Some(temp_dir.path().join("data").to_string_lossy().into_owned()),
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            text_output_directory: self
                .text_output
                .then(|| temp_dir.path().join("text").to_string_lossy().into_owned()),
            uploads_directory: self
                .uploads
                .then(|| temp_dir.path().join("uploads").to_string_lossy().into_owned()),
            ..Config::default()
        };

        let ocr = Arc::new(FakeOcr::new());
        let extractors = match self.extractors {
            Some(registry) => registry,
            None => {
                let engine: Arc<dyn OcrEngine> = if self.ocr_available {
                    ocr.clone()
                } else {
                    Arc::new(UnavailableEngine::new("tesseract is not installed"))
                };
                ExtractorRegistry::new(
                    engine,
                    Arc::new(FakeRasterizer {
                        failing: self.failing_pages,
                    }),
                    PdfOptions { min_page_chars: 5 },
                )
            }
        };

        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        let settings = Arc::new(MemorySettings::new());
        let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let sqlite = SqliteDocumentStore::new(db, config.search.similarity_threshold);
        let flaky = self
            .failing_upserts
            .map(|count| Arc::new(FlakyDocuments::new(sqlite.clone(), count)));
        let documents: Arc<dyn DocumentStore> = match &flaky {
            Some(flaky) => flaky.clone(),
            None => Arc::new(sqlite),
        };

        let ingestor = Ingestor::with_parts(IngestorParts {
            config,
            settings: settings.clone(),
            jobs: Arc::clone(&jobs),
            documents: Arc::clone(&documents),
            extractors: Arc::new(extractors),
        })
        .expect("Failed to assemble ingestor");

        TestHarness {
            temp_dir,
            docs_dir,
            ingestor,
            settings,
            jobs,
            documents,
            flaky,
            ocr,
        }
    }
}

/// An ingestor over in-memory stores, rooted in its own temp directory.
pub struct TestHarness {
    pub temp_dir: TempDir,
    pub docs_dir: PathBuf,
    pub ingestor: Ingestor,
    pub settings: Arc<MemorySettings>,
    pub jobs: Arc<dyn JobStore>,
    pub documents: Arc<dyn DocumentStore>,
    /// Set when built with [`HarnessBuilder::failing_upserts`].
    pub flaky: Option<Arc<FlakyDocuments>>,
    pub ocr: Arc<FakeOcr>,
}

impl TestHarness {
    /// Two workers, working OCR, no sidecar output.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            worker_count: 2,
            queue_capacity: None,
            ocr_available: true,
            failing_pages: Vec::new(),
            extractors: None,
            text_output: false,
            uploads: false,
            failing_upserts: None,
        }
    }

    /// Writes a file below the documents directory, creating parents.
    pub fn write_doc(&self, relative: &str, bytes: &[u8]) -> PathBuf {
        let path = self.docs_dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        std::fs::write(&path, bytes).expect("Failed to write document");
        path
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.temp_dir.path().join(relative)
    }

    pub fn text_dir(&self) -> PathBuf {
        self.temp_dir.path().join("text")
    }

    pub fn settings_store(&self) -> &dyn SettingsStore {
        self.settings.as_ref()
    }

    /// Polls until the job reaches a terminal state.
    pub fn wait_for_job(&self, job_id: &str) -> Job {
        let deadline = Instant::now() + JOB_TIMEOUT;
        loop {
            let job = self
                .ingestor
                .poll_status(job_id)
                .expect("Failed to poll job status");
            if job.is_finished() {
                return job;
            }
            assert!(
                Instant::now() < deadline,
                "Job {} did not finish in time: {:?}",
                job_id,
                job
            );
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Scans `root` and waits for the batch job to finish.
    pub fn ingest_dir(&self, root: &Path) -> Job {
        let job_id = self
            .ingestor
            .ingest_batch(root, true)
            .expect("Failed to start batch job");
        self.wait_for_job(&job_id)
    }
}
