//! Filesystem helpers shared across modules.
//!
//! These helpers attach the operation and path to IO errors.

use std::path::Path;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Replace `path` with `contents` without ever exposing a partially written file.
///
/// The data goes to a sibling temp file first and is renamed over the target.
pub async fn write_atomic(op: &'static str, path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir_all_with_op(op, parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| io_error(op, &tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_file_if_exists(op: &'static str, path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(op, path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ensure_dir_creates_nested_directories() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b").join("c");
        ensure_dir_all_with_op("creating test dir", &nested)
            .await
            .unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state").join("queue.json");

        write_atomic("writing test file", &path, b"first").await.unwrap();
        write_atomic("writing test file", &path, b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!temp.path().join("state").join("queue.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_remove_missing_file_is_ok() {
        let temp = TempDir::new().unwrap();
        remove_file_if_exists("removing test file", &temp.path().join("nope"))
            .await
            .unwrap();
    }
}
