use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::naming::{safe_filename, split_extension};
use crate::error::StorageError;

const MAX_NAME_ATTEMPTS: usize = 1000;

/// Writes extracted text as `.txt` sidecars into one directory.
#[derive(Debug, Clone)]
pub struct TextOutput {
    directory: PathBuf,
}

impl TextOutput {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Writes `text` to `<stem>.txt`, where the stem comes from the source
    /// file name. Existing files are never overwritten; a collision moves
    /// on to `<stem>_2.txt`, `<stem>_3.txt` and so on.
    pub fn write(&self, source_name: &str, text: &str) -> Result<PathBuf, StorageError> {
        ensure_directory(&self.directory)?;
        let safe = safe_filename(source_name);
        let (stem, _) = split_extension(&safe);
        create_unique(&self.directory, stem, "txt", text.as_bytes())
    }
}

/// Creates `<base>.<ext>` exclusively, trying numbered variants when the
/// name is taken. `create_new` makes the check and the creation one step.
fn create_unique(
    directory: &Path,
    base: &str,
    ext: &str,
    content: &[u8],
) -> Result<PathBuf, StorageError> {
    for counter in 1..=MAX_NAME_ATTEMPTS {
        let name = if counter == 1 {
            format!("{}.{}", base, ext)
        } else {
            format!("{}_{}.{}", base, counter, ext)
        };
        let path = directory.join(&name);

        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(content).map_err(|e| StorageError::WriteFile {
                    path: path.clone(),
                    source: e,
                })?;
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(StorageError::WriteFile { path, source: e }),
        }
    }

    Err(StorageError::NameExhausted {
        directory: directory.to_path_buf(),
        name: format!("{}.{}", base, ext),
    })
}

/// Stores an uploaded original under its sanitized name, replacing any
/// earlier upload of the same name so its source path stays stable.
pub fn save_upload(directory: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
    ensure_directory(directory)?;
    let path = directory.join(safe_filename(name));
    fs::write(&path, bytes).map_err(|e| StorageError::WriteFile {
        path: path.clone(),
        source: e,
    })?;
    Ok(path)
}

fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_sidecar() {
        let temp_dir = TempDir::new().unwrap();
        let output = TextOutput::new(temp_dir.path().join("text"));

        let path = output.write("invoice.pdf", "Total 42").unwrap();

        assert!(path.ends_with("text/invoice.txt"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "Total 42");
    }

    #[test]
    fn test_sidecar_collisions_are_numbered() {
        let temp_dir = TempDir::new().unwrap();
        let output = TextOutput::new(temp_dir.path());

        let first = output.write("report.pdf", "one").unwrap();
        let second = output.write("report.docx", "two").unwrap();
        let third = output.write("report.xlsx", "three").unwrap();

        assert!(first.ends_with("report.txt"));
        assert!(second.ends_with("report_2.txt"));
        assert!(third.ends_with("report_3.txt"));
        assert_eq!(fs::read_to_string(first).unwrap(), "one");
    }

    #[test]
    fn test_sidecar_name_is_sanitized() {
        let temp_dir = TempDir::new().unwrap();
        let output = TextOutput::new(temp_dir.path());

        let path = output.write("../../etc/pass:wd.png", "x").unwrap();

        assert_eq!(path.parent().unwrap(), temp_dir.path());
        assert!(path.ends_with("pass_wd.txt"));
    }

    #[test]
    fn test_save_upload_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("uploads");

        let first = save_upload(&dir, "scan.png", b"v1").unwrap();
        let second = save_upload(&dir, "scan.png", b"v2").unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read(&second).unwrap(), b"v2");
    }

    #[test]
    fn test_save_upload_empty_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = save_upload(temp_dir.path(), "empty.pdf", &[]).unwrap();
        assert!(fs::read(path).unwrap().is_empty());
    }
}
