//! Helpers for keeping span attributes free of full filesystem paths.
//!
//! Scan roots and uploads often live under a user's home directory, so spans
//! carry only a file name or a short hash of the path.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Short deterministic hash of a path, for correlating log lines about the
/// same file without printing where it lives.
pub fn hash_path(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_redact_path_returns_filename() {
        assert_eq!(
            redact_path(&PathBuf::from("/home/user/Documents/invoice.pdf")),
            "invoice.pdf"
        );
        assert_eq!(redact_path(&PathBuf::from("/")), "<unknown>");
    }

    #[test]
    fn test_hash_path_is_stable_and_distinct() {
        let a = PathBuf::from("/scans/a.pdf");
        let b = PathBuf::from("/scans/b.pdf");
        assert_eq!(hash_path(&a), hash_path(&a));
        assert_ne!(hash_path(&a), hash_path(&b));
        assert_eq!(hash_path(&a).len(), 16);
    }
}
