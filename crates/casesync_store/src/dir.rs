//! Store directory management.
//!
//! The LOCK file ensures only one engine process writes to a data directory.

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";

/// A locked store directory.
///
/// The exclusive lock is held for as long as this value lives.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens (creating if needed) and locks a store directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another process holds the lock.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(StoreError::invalid(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of a file inside the directory.
    #[must_use]
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_missing_directory() {
        let root = tempdir().unwrap();
        let path = root.path().join("nested").join("data");
        let dir = StoreDir::open(&path).unwrap();
        assert!(dir.path().is_dir());
        assert!(path.join(LOCK_FILE).exists());
    }

    #[test]
    fn second_open_is_locked() {
        let root = tempdir().unwrap();
        let _first = StoreDir::open(root.path()).unwrap();
        let second = StoreDir::open(root.path());
        assert!(matches!(second, Err(StoreError::Locked(_))));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let root = tempdir().unwrap();
        drop(StoreDir::open(root.path()).unwrap());
        assert!(StoreDir::open(root.path()).is_ok());
    }
}
