//! Persistent user settings, and the documents directory built on them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde_json::{Map, Value};

use crate::error::SettingsError;

pub const DOCUMENTS_DIR_KEY: &str = "documents_dir";

/// Key/value settings that outlive the process.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, SettingsError>;
    fn set(&self, key: &str, value: Value) -> Result<(), SettingsError>;
}

/// A flat JSON object in a file, typically `settings.json` in the data
/// directory.
pub struct JsonFileSettings {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl JsonFileSettings {
    /// Opens the settings file, creating it as `{}` when missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| SettingsError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
            write_atomic(&path, &Map::new())?;
            log::info!("Created settings file at {}", path.display());
        }
        let settings = Self {
            path,
            write_lock: Mutex::new(()),
        };
        settings.read_all()?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Map<String, Value>, SettingsError> {
        let content = fs::read_to_string(&self.path).map_err(|e| SettingsError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_str(&content).map_err(|e| SettingsError::Parse {
            path: self.path.clone(),
            source: e,
        })
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Result<Option<Value>, SettingsError> {
        Ok(self.read_all()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| {
            log::warn!("Settings lock poisoned, recovering");
            poisoned.into_inner()
        });
        let mut all = self.read_all()?;
        all.insert(key.to_string(), value);
        write_atomic(&self.path, &all)
    }
}

/// Writes through a sibling temp file and a rename, so readers never see
/// a partially written object.
fn write_atomic(path: &Path, values: &Map<String, Value>) -> Result<(), SettingsError> {
    let io_err = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_string_pretty(values).map_err(|e| SettingsError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, json).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_err(e)
    })
}

/// Settings held in memory only.
#[derive(Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, Value>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Result<Option<Value>, SettingsError> {
        let values = self.values.read().unwrap_or_else(|p| p.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
        values.insert(key.to_string(), value);
        Ok(())
    }
}

/// The root a batch scans when the caller names none.
pub struct DocumentsDir;

impl DocumentsDir {
    /// Returns the persisted directory; when none is persisted yet, stores
    /// `default` once and returns it. A persisted value always wins over a
    /// changed default.
    pub fn initialize(store: &dyn SettingsStore, default: &Path) -> Result<PathBuf, SettingsError> {
        if let Some(existing) = Self::read(store)? {
            return Ok(existing);
        }
        store.set(
            DOCUMENTS_DIR_KEY,
            Value::String(default.to_string_lossy().into_owned()),
        )?;
        log::info!("Documents directory initialized to {}", default.display());
        Ok(default.to_path_buf())
    }

    pub fn get(store: &dyn SettingsStore) -> Result<PathBuf, SettingsError> {
        Self::read(store)?.ok_or_else(|| SettingsError::Missing(DOCUMENTS_DIR_KEY.to_string()))
    }

    /// Validates and persists a new directory, returning its canonical form.
    pub fn set(store: &dyn SettingsStore, path: &Path) -> Result<PathBuf, SettingsError> {
        let invalid = |reason: String| SettingsError::InvalidDocumentsDir {
            path: path.to_path_buf(),
            reason,
        };

        let metadata = fs::metadata(path).map_err(|e| invalid(e.to_string()))?;
        if !metadata.is_dir() {
            return Err(invalid("not a directory".to_string()));
        }
        fs::read_dir(path).map_err(|e| invalid(format!("not readable: {}", e)))?;
        let canonical = fs::canonicalize(path).map_err(|e| invalid(e.to_string()))?;

        store.set(
            DOCUMENTS_DIR_KEY,
            Value::String(canonical.to_string_lossy().into_owned()),
        )?;
        log::info!("Documents directory set to {}", canonical.display());
        Ok(canonical)
    }

    fn read(store: &dyn SettingsStore) -> Result<Option<PathBuf>, SettingsError> {
        match store.get(DOCUMENTS_DIR_KEY)? {
            Some(Value::String(s)) if !s.is_empty() => Ok(Some(PathBuf::from(s))),
            Some(other) => {
                log::warn!("Ignoring malformed documents_dir setting: {}", other);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use assert_fs::TempDir;

    #[test]
    fn test_open_creates_empty_object() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data").join("settings.json");
        let settings = JsonFileSettings::open(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "{}");
        assert_eq!(settings.get("anything").unwrap(), None);
    }

    #[test]
    fn test_set_persists_across_instances() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        JsonFileSettings::open(&path)
            .unwrap()
            .set("theme", Value::from("dark"))
            .unwrap();

        let reopened = JsonFileSettings::open(&path).unwrap();
        assert_eq!(reopened.get("theme").unwrap(), Some(Value::from("dark")));
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let temp = TempDir::new().unwrap();
        let file = temp.child("settings.json");
        file.write_str("{not json").unwrap();
        assert!(matches!(
            JsonFileSettings::open(file.path()),
            Err(SettingsError::Parse { .. })
        ));
    }

    #[test]
    fn test_initialize_writes_default_once() {
        let store = MemorySettings::new();
        let first = DocumentsDir::initialize(&store, Path::new("/srv/docs")).unwrap();
        assert_eq!(first, PathBuf::from("/srv/docs"));

        // A later, different default must not override the persisted value.
        let second = DocumentsDir::initialize(&store, Path::new("/other")).unwrap();
        assert_eq!(second, PathBuf::from("/srv/docs"));
        assert_eq!(DocumentsDir::get(&store).unwrap(), PathBuf::from("/srv/docs"));
    }

    #[test]
    fn test_get_without_value_is_missing() {
        let store = MemorySettings::new();
        assert!(matches!(
            DocumentsDir::get(&store),
            Err(SettingsError::Missing(_))
        ));
    }

    #[test]
    fn test_set_validates_and_canonicalizes() {
        let temp = TempDir::new().unwrap();
        temp.child("inbox").create_dir_all().unwrap();
        temp.child("note.txt").write_str("x").unwrap();
        let store = MemorySettings::new();

        let set = DocumentsDir::set(&store, &temp.path().join("inbox/../inbox")).unwrap();
        assert_eq!(set, fs::canonicalize(temp.path().join("inbox")).unwrap());
        assert_eq!(DocumentsDir::get(&store).unwrap(), set);

        assert!(matches!(
            DocumentsDir::set(&store, &temp.path().join("missing")),
            Err(SettingsError::InvalidDocumentsDir { .. })
        ));
        assert!(matches!(
            DocumentsDir::set(&store, &temp.path().join("note.txt")),
            Err(SettingsError::InvalidDocumentsDir { .. })
        ));
        // Rejected updates leave the previous value in place.
        assert_eq!(DocumentsDir::get(&store).unwrap(), set);
    }
}
