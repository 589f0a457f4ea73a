//! Document file access.
//!
//! # Responsibility
//! - Read and write document files for the engine.
//! - Resolve user-supplied paths into stable absolute keys.
//!
//! # Invariants
//! - Writes only touch the file when its bytes would change, so a no-op pass
//!   emits no filesystem event.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

const BACKUP_SUFFIX: &str = ".backup";

/// Reads a document, treating a missing file as empty.
pub fn read_document(path: &Path) -> io::Result<String> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err),
    }
}

/// Reads a document that must exist.
pub fn read_existing_document(path: &Path) -> io::Result<String> {
    fs::read_to_string(path)
}

/// Writes `content` unless the file already holds exactly these bytes.
///
/// Returns whether the file was written.
pub fn write_if_changed(path: &Path, content: &str) -> io::Result<bool> {
    match fs::read(path) {
        Ok(existing) if existing == content.as_bytes() => return Ok(false),
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(true)
}

/// Path of the backup copy kept next to `path`.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Copies the current document to its backup path.
///
/// Returns `None` when there is nothing worth keeping (missing or empty file).
pub fn backup_document(path: &Path) -> io::Result<Option<PathBuf>> {
    let current = read_document(path)?;
    if current.trim().is_empty() {
        return Ok(None);
    }
    let target = backup_path(path);
    fs::write(&target, current)?;
    Ok(Some(target))
}

/// Turns `raw` into an absolute path.
///
/// Existing paths are canonicalized so that the key matches the paths
/// reported by filesystem events; missing paths are joined onto the current
/// directory.
pub fn resolve_path(raw: &Path) -> io::Result<PathBuf> {
    match fs::canonicalize(raw) {
        Ok(resolved) => Ok(resolved),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            if raw.is_absolute() {
                Ok(raw.to_path_buf())
            } else {
                Ok(std::env::current_dir()?.join(raw))
            }
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::{backup_document, backup_path, read_document, resolve_path, write_if_changed};
    use std::fs;

    #[test]
    fn missing_document_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_document(&dir.path().join("none.md")).unwrap(), "");
    }

    #[test]
    fn write_if_changed_skips_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");

        assert!(write_if_changed(&path, "a\n\nb").unwrap());
        assert!(!write_if_changed(&path, "a\n\nb").unwrap());
        assert!(write_if_changed(&path, "b\n\na").unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "b\n\na");
    }

    #[test]
    fn backup_copies_non_empty_documents_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");

        fs::write(&path, "  \n").unwrap();
        assert!(backup_document(&path).unwrap().is_none());

        fs::write(&path, "keep me").unwrap();
        let target = backup_document(&path).unwrap().unwrap();
        assert_eq!(target, backup_path(&path));
        assert_eq!(fs::read_to_string(target).unwrap(), "keep me");
    }

    #[test]
    fn resolve_path_canonicalizes_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        fs::write(&path, "x").unwrap();

        let resolved = resolve_path(&dir.path().join(".").join("doc.md")).unwrap();
        assert_eq!(resolved, fs::canonicalize(&path).unwrap());
    }

    #[test]
    fn resolve_path_keeps_missing_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.md");
        assert_eq!(resolve_path(&missing).unwrap(), missing);
    }
}
