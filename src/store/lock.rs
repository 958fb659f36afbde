//! Process-wide run lock.
//!
//! Two concurrent runs against the same datafile would both load the
//! same state, both deliver, and one save would silently erase the
//! other's progress. A single advisory lock file, acquired exclusively
//! at startup and held for the whole run, serializes instances
//! end-to-end. The lock file sits next to the datafile and is
//! independent of it, so the datafile itself can be atomically replaced
//! while the lock is held.

use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

use super::datafile::StoreError;

/// Held exclusive lock; released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Acquire the lock, blocking until any other instance finishes.
    pub fn acquire(path: &Path) -> Result<Self, StoreError> {
        let file = Self::open(path)?;
        tracing::debug!(path = %path.display(), "acquiring run lock");
        file.lock_exclusive()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Acquire the lock without blocking; `Ok(None)` means another
    /// instance holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, StoreError> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn open(path: &Path) -> Result<File, StoreError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_instance_cannot_acquire_while_held() {
        let dir = std::env::temp_dir().join("feedmail_lock_test_exclusive");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.lock");

        let held = StoreLock::acquire(&path).unwrap();
        // fs2 locks are per file handle, so a second open sees it held.
        assert!(StoreLock::try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(StoreLock::try_acquire(&path).unwrap().is_some());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_lock_creates_missing_parent_dir() {
        let dir = std::env::temp_dir().join("feedmail_lock_test_mkdir/nested");
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
        let path = dir.join("run.lock");

        let lock = StoreLock::acquire(&path).unwrap();
        assert!(lock.path().exists());

        drop(lock);
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }
}
