use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use walkdir::{DirEntry, FilterEntry, WalkDir};

use crate::config::DeclaredType;
use crate::error::ScanError;
use crate::sanitize::redact_path;

/// Lock files Office writes next to an open document.
const OFFICE_LOCK_PREFIX: &str = "~$";
const TEMP_SUFFIX: &str = ".tmp";

/// A file selected for extraction. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileCandidate {
    pub path: PathBuf,
    pub declared_type: DeclaredType,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub mime_type: String,
}

impl FileCandidate {
    /// Checks a single known file the way a walk checks each entry.
    pub fn from_path(path: &Path) -> Result<Self, ScanError> {
        let entry_error = |reason: String| ScanError::Entry {
            path: path.to_path_buf(),
            reason,
        };
        let declared_type = DeclaredType::from_path(path)
            .ok_or_else(|| entry_error("unsupported file type".to_string()))?;
        let metadata = std::fs::metadata(path).map_err(|e| entry_error(e.to_string()))?;
        if !metadata.is_file() {
            return Err(entry_error("not a regular file".to_string()));
        }
        checked_candidate(path, declared_type, &metadata)
    }

    pub fn file_name(&self) -> String {
        redact_path(&self.path)
    }
}

pub struct DirectoryScanner {
    root: PathBuf,
    recursive: bool,
}

impl DirectoryScanner {
    pub fn new<P: AsRef<Path>>(root: P, recursive: bool) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            recursive,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Starts a walk. The root is checked up front so an unreadable root is
    /// reported before any candidate; every later problem is a warning item.
    ///
    /// Each call returns a fresh iterator, so a scan can be restarted.
    pub fn scan(&self) -> Result<ScanIter, ScanError> {
        let metadata = std::fs::metadata(&self.root).map_err(|e| ScanError::RootUnreadable {
            path: self.root.clone(),
            source: e,
        })?;
        if !metadata.is_dir() {
            return Err(ScanError::NotADirectory(self.root.clone()));
        }
        std::fs::read_dir(&self.root).map_err(|e| ScanError::RootUnreadable {
            path: self.root.clone(),
            source: e,
        })?;

        let max_depth = if self.recursive { usize::MAX } else { 1 };
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(keep_entry as fn(&DirEntry) -> bool);

        Ok(ScanIter {
            walker,
            seen: HashSet::new(),
        })
    }

    /// Drains a full scan: candidates in walk order plus the warnings met on
    /// the way.
    pub fn scan_all(&self) -> Result<(Vec<FileCandidate>, Vec<ScanError>), ScanError> {
        let _span = tracing::info_span!(
            "scanner.scan",
            root = %redact_path(&self.root),
            recursive = self.recursive
        )
        .entered();

        let mut candidates = Vec::new();
        let mut warnings = Vec::new();
        for item in self.scan()? {
            match item {
                Ok(candidate) => candidates.push(candidate),
                Err(warning) => {
                    warn!("{}", warning);
                    warnings.push(warning);
                }
            }
        }

        info!(
            "Scanned {} documents in {} ({} warnings)",
            candidates.len(),
            self.root.display(),
            warnings.len()
        );
        Ok((candidates, warnings))
    }
}

/// Lazy walk over a scan root yielding candidates and warning-level errors.
///
/// Links are followed, so one file can be reached by several paths. Only
/// the first path to each canonical file is yielded.
pub struct ScanIter {
    walker: FilterEntry<walkdir::IntoIter, fn(&DirEntry) -> bool>,
    seen: HashSet<PathBuf>,
}

impl Iterator for ScanIter {
    type Item = Result<FileCandidate, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(walk_error(err))),
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            if !file_type.is_file() {
                debug!("Skipping non-regular file: {}", entry.path().display());
                continue;
            }

            let Some(declared_type) = DeclaredType::from_path(entry.path()) else {
                debug!("Skipping unsupported file: {}", entry.path().display());
                continue;
            };

            let canonical = std::fs::canonicalize(entry.path())
                .unwrap_or_else(|_| entry.path().to_path_buf());
            if !self.seen.insert(canonical) {
                debug!("Skipping file already reached: {}", entry.path().display());
                continue;
            }

            return Some(candidate(&entry, declared_type));
        }
    }
}

fn candidate(entry: &DirEntry, declared_type: DeclaredType) -> Result<FileCandidate, ScanError> {
    let metadata = entry.metadata().map_err(|e| ScanError::Entry {
        path: entry.path().to_path_buf(),
        reason: e.to_string(),
    })?;
    checked_candidate(entry.path(), declared_type, &metadata)
}

/// Opens the file once so an unreadable file is a scan warning rather than
/// a failed job item.
fn checked_candidate(
    path: &Path,
    declared_type: DeclaredType,
    metadata: &std::fs::Metadata,
) -> Result<FileCandidate, ScanError> {
    std::fs::File::open(path).map_err(|e| ScanError::Entry {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok(FileCandidate {
        path: path.to_path_buf(),
        declared_type,
        size: metadata.len(),
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        mime_type: mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    })
}

fn walk_error(err: walkdir::Error) -> ScanError {
    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
    match err.loop_ancestor() {
        Some(ancestor) => ScanError::Loop {
            path,
            ancestor: ancestor.to_path_buf(),
        },
        None => ScanError::Entry {
            path,
            reason: err
                .io_error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| err.to_string()),
        },
    }
}

/// The root itself is always walked, even when it is a hidden temp dir.
fn keep_entry(entry: &DirEntry) -> bool {
    entry.depth() == 0 || !is_ignored_name(&entry.file_name().to_string_lossy())
}

pub fn is_ignored_name(name: &str) -> bool {
    name.starts_with('.')
        || name.starts_with(OFFICE_LOCK_PREFIX)
        || name.to_ascii_lowercase().ends_with(TEMP_SUFFIX)
}
