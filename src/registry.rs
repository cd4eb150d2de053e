//! Enforces at most one open handle per queue directory.
//!
//! Two layers protect the directory: an in-process [`HashSet`] catches a second
//! [`crate::Queue::open`] call within the same process before it touches the filesystem at all,
//! and an [`fslock::LockFile`] on `<path>/.lock` catches a second process entirely. Both are
//! released together when the returned [`DirectoryGuard`] drops.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

use fslock::LockFile;

use crate::error::QueueError;

fn open_directories() -> &'static Mutex<HashSet<PathBuf>> {
    static REGISTRY: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Holds this process' claim on a queue directory for as long as it lives.
///
/// Dropping the guard removes the directory from the in-process registry and releases the
/// advisory file lock, making the directory available to be opened again.
pub(crate) struct DirectoryGuard {
    canonical_path: PathBuf,
    file_lock: LockFile,
}

impl DirectoryGuard {
    /// Claims `path` for this process, failing with [`QueueError::ConfigMismatch`] if it is
    /// already held by a live handle in this process or another.
    pub fn acquire(path: &Path) -> Result<Self, QueueError> {
        let canonical_path = path.canonicalize()?;

        {
            let mut held = open_directories()
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !held.insert(canonical_path.clone()) {
                return Err(QueueError::config_mismatch(format!(
                    "queue directory {} is already open in this process",
                    canonical_path.display()
                )));
            }
        }

        let lock_path = canonical_path.join(".lock");
        let mut file_lock = LockFile::open(&lock_path).map_err(|e| {
            release_from_registry(&canonical_path);
            QueueError::from(e)
        })?;

        let acquired = file_lock.try_lock().map_err(|e| {
            release_from_registry(&canonical_path);
            QueueError::from(e)
        })?;

        if !acquired {
            release_from_registry(&canonical_path);
            return Err(QueueError::config_mismatch(format!(
                "queue directory {} is already open in another process",
                canonical_path.display()
            )));
        }

        debug!(path = %canonical_path.display(), "Acquired directory lock.");

        Ok(Self {
            canonical_path,
            file_lock,
        })
    }
}

fn release_from_registry(path: &Path) {
    open_directories()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(path);
}

impl Drop for DirectoryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file_lock.unlock() {
            warn!(path = %self.canonical_path.display(), error = %e, "Failed to release directory lock file.");
        }
        release_from_registry(&self.canonical_path);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn second_acquire_in_process_fails() {
        let dir = tempdir().expect("tempdir");
        let first = DirectoryGuard::acquire(dir.path()).expect("first acquire succeeds");

        let second = DirectoryGuard::acquire(dir.path());
        assert!(second.is_err());

        drop(first);
        // Once released, acquiring again must succeed.
        let third = DirectoryGuard::acquire(dir.path()).expect("acquire after release succeeds");
        drop(third);
    }

    #[test]
    fn distinct_directories_do_not_conflict() {
        let dir_a = tempdir().expect("tempdir a");
        let dir_b = tempdir().expect("tempdir b");

        let _a = DirectoryGuard::acquire(dir_a.path()).expect("acquire a");
        let _b = DirectoryGuard::acquire(dir_b.path()).expect("acquire b");
    }
}
