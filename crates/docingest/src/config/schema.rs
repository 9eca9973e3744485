use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    /// Default scan root. Only written to settings when no value is persisted yet.
    #[serde(default)]
    pub documents_dir: Option<String>,
    /// Holds `docingest.db` and `settings.json`.
    #[serde(default)]
    pub data_directory: Option<String>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub text_output_directory: Option<String>,
    #[serde(default)]
    pub uploads_directory: Option<String>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            documents_dir: None,
            data_directory: None,
            worker_count: default_worker_count(),
            queue_capacity: None,
            ocr: OcrConfig::default(),
            jobs: JobsConfig::default(),
            search: SearchConfig::default(),
            text_output_directory: None,
            uploads_directory: None,
        }
    }
}

impl Config {
    /// Bounded queue depth; twice the worker count unless configured.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or(self.worker_count.max(1) * 2)
            .max(1)
    }

    pub fn data_directory(&self) -> PathBuf {
        match &self.data_directory {
            Some(dir) => PathBuf::from(dir),
            None => default_data_directory(),
        }
    }

    pub fn default_documents_dir(&self) -> PathBuf {
        match &self.documents_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::document_dir()
                .or_else(|| dirs::home_dir().map(|h| h.join("Documents")))
                .unwrap_or_else(|| PathBuf::from("documents")),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_directory().join("docingest.db")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_directory().join("settings.json")
    }

    pub fn text_output_directory(&self) -> Option<PathBuf> {
        self.text_output_directory.as_ref().map(PathBuf::from)
    }

    pub fn uploads_directory(&self) -> Option<PathBuf> {
        self.uploads_directory.as_ref().map(PathBuf::from)
    }
}

/// `~/.docingest/data`, or a relative `.docingest/data` without a home directory.
pub fn default_data_directory() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".docingest").join("data"))
        .unwrap_or_else(|| PathBuf::from(".docingest").join("data"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    /// Pages with fewer non-whitespace characters of embedded text are OCRed.
    #[serde(default = "default_min_page_chars")]
    pub min_page_chars: usize,
    #[serde(default = "default_true")]
    pub preprocess: bool,
}

fn default_true() -> bool {
    true
}

fn default_languages() -> Vec<String> {
    vec!["eng".to_string()]
}

fn default_dpi() -> u32 {
    300
}

fn default_min_page_chars() -> usize {
    20
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            languages: default_languages(),
            dpi: default_dpi(),
            min_page_chars: default_min_page_chars(),
            preprocess: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub backend: JobBackend,
    #[serde(default = "default_result_list_limit")]
    pub result_list_limit: usize,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_result_list_limit() -> usize {
    100
}

fn default_retention_hours() -> u64 {
    12
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            backend: JobBackend::Memory,
            result_list_limit: default_result_list_limit(),
            retention_hours: default_retention_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,
}

fn default_similarity_threshold() -> f64 {
    0.3
}

fn default_search_limit() -> usize {
    20
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            default_limit: default_search_limit(),
        }
    }
}

/// The closed set of file types the pipeline extracts text from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredType {
    Pdf,
    Image,
    Docx,
    Xlsx,
}

impl DeclaredType {
    pub const SUPPORTED_EXTENSIONS: &'static [&'static str] =
        &["pdf", "png", "jpg", "jpeg", "docx", "xlsx"];

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "png" | "jpg" | "jpeg" => Some(Self::Image),
            "docx" => Some(Self::Docx),
            "xlsx" => Some(Self::Xlsx),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Image => "image",
            Self::Docx => "docx",
            Self::Xlsx => "xlsx",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(Self::Pdf),
            "image" => Some(Self::Image),
            "docx" => Some(Self::Docx),
            "xlsx" => Some(Self::Xlsx),
            _ => None,
        }
    }
}

impl fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
