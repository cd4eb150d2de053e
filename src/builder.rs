//! Builder for opening a [`Queue`].
//!
//! Mirrors the teacher's generic-swapping config builder: each method that changes the item type
//! or serializer returns `QueueBuilder<T2, S2>` rather than mutating in place, so a misuse like
//! forgetting to call `.serializer()` before `.open()` is caught by the type system instead of at
//! runtime.

use std::{
    fs,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use crate::{
    chunk::ChunkManager,
    error::QueueError,
    info::InfoStore,
    queue::Queue,
    registry::DirectoryGuard,
    serializer::{JsonSerializer, Serializer},
};

const DEFAULT_CHUNKSIZE: u32 = 100;

/// Builds a [`Queue`] over a directory, with defaults matching a bounded-but-generous, JSON-backed
/// queue: `maxsize = 0` (unbounded), `chunksize = 100`, `autosave = false`, `tempdir` = the queue
/// directory itself.
pub struct QueueBuilder<T, S = JsonSerializer<T>> {
    path: PathBuf,
    maxsize: u64,
    chunksize: u32,
    tempdir: Option<PathBuf>,
    autosave: bool,
    serializer: S,
    _marker: PhantomData<fn(T)>,
}

impl<T> QueueBuilder<T, JsonSerializer<T>>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    /// Starts a builder for a queue rooted at `path`, defaulting to [`JsonSerializer`].
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            maxsize: 0,
            chunksize: DEFAULT_CHUNKSIZE,
            tempdir: None,
            autosave: false,
            serializer: JsonSerializer::new(),
            _marker: PhantomData,
        }
    }
}

impl<T, S> QueueBuilder<T, S> {
    /// Sets the soft cap on logical queue length; 0 (the default) means unbounded.
    #[must_use]
    pub fn maxsize(mut self, maxsize: u64) -> Self {
        self.maxsize = maxsize;
        self
    }

    /// Sets the number of records held per chunk file. Must be strictly positive.
    #[must_use]
    pub fn chunksize(mut self, chunksize: u32) -> Self {
        self.chunksize = chunksize;
        self
    }

    /// Sets the staging directory used for atomic info-record replacement.
    ///
    /// Must reside on the same filesystem as `path`, or [`QueueBuilder::open`] fails with
    /// [`QueueError::ConfigMismatch`].
    #[must_use]
    pub fn tempdir(mut self, tempdir: impl Into<PathBuf>) -> Self {
        self.tempdir = Some(tempdir.into());
        self
    }

    /// When enabled, `get` durably persists the advanced tail immediately rather than deferring to
    /// the next `task_done`, trading at-least-once redelivery for at-most-once-on-restart.
    #[must_use]
    pub fn autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }

    /// Swaps in a different item type and serializer.
    #[must_use]
    pub fn serializer<T2, S2>(self, serializer: S2) -> QueueBuilder<T2, S2>
    where
        S2: Serializer<T2>,
    {
        QueueBuilder {
            path: self.path,
            maxsize: self.maxsize,
            chunksize: self.chunksize,
            tempdir: self.tempdir,
            autosave: self.autosave,
            serializer,
            _marker: PhantomData,
        }
    }
}

impl<T, S> QueueBuilder<T, S>
where
    S: Serializer<T>,
{
    /// Validates the configuration, opens (or creates) the queue directory, recovers its state
    /// from whatever is on disk, and returns a ready-to-use [`Queue`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConfigMismatch`] if `chunksize` is zero, if `tempdir` is not on the
    /// same filesystem as `path`, if the directory is already open elsewhere, or if the directory
    /// was created with a different serializer version.
    pub fn open(self) -> Result<Queue<T, S>, QueueError> {
        if self.chunksize == 0 {
            return Err(QueueError::config_mismatch("chunksize must be strictly positive"));
        }

        fs::create_dir_all(&self.path)?;
        let directory_guard = DirectoryGuard::acquire(&self.path)?;
        let data_dir = self.path.canonicalize()?;

        let tempdir = match self.tempdir {
            Some(t) => {
                fs::create_dir_all(&t)?;
                let canonical = t.canonicalize()?;
                same_filesystem(&data_dir, &canonical)?;
                canonical
            }
            None => data_dir.clone(),
        };

        let present_chunks = ChunkManager::list_chunk_ids(&data_dir)?;
        let oldest_chunk_id = present_chunks.first().copied().unwrap_or(0);
        let mut chunk_mgr = ChunkManager::new(data_dir.clone(), self.chunksize, oldest_chunk_id);

        let info_store = InfoStore::new(&data_dir, &tempdir);
        let initial = info_store.recover(&data_dir, &mut chunk_mgr, S::VERSION, self.chunksize)?;

        info!(
            path = %data_dir.display(),
            chunksize = self.chunksize,
            maxsize = self.maxsize,
            autosave = self.autosave,
            size = initial.size,
            "Opened queue directory."
        );

        Ok(Queue::new(
            info_store,
            chunk_mgr,
            initial,
            self.maxsize,
            self.chunksize,
            self.autosave,
            self.serializer,
            directory_guard,
        ))
    }
}

#[cfg(unix)]
fn same_filesystem(a: &Path, b: &Path) -> Result<(), QueueError> {
    use std::os::unix::fs::MetadataExt;

    let dev_a = fs::metadata(a)?.dev();
    let dev_b = fs::metadata(b)?.dev();
    if dev_a != dev_b {
        return Err(QueueError::config_mismatch(format!(
            "tempdir {} is not on the same filesystem as {}",
            b.display(),
            a.display()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn same_filesystem(_a: &Path, _b: &Path) -> Result<(), QueueError> {
    // Cross-filesystem rename detection is POSIX-specific; on other platforms a cross-filesystem
    // tempdir will simply fail at rename time in `InfoStore::persist` instead of at open time.
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Item(String);

    #[test]
    fn open_creates_missing_directory() {
        let parent = tempdir().expect("tempdir");
        let path = parent.path().join("nested").join("queue");

        let queue = QueueBuilder::<Item>::new(&path).open().expect("open");
        assert_eq!(queue.size(), 0);
        assert!(path.exists());
    }

    #[test]
    fn rejects_zero_chunksize() {
        let dir = tempdir().expect("tempdir");
        let err = QueueBuilder::<Item>::new(dir.path())
            .chunksize(0)
            .open()
            .expect_err("zero chunksize should be rejected");
        assert!(matches!(err, QueueError::ConfigMismatch { .. }));
    }

    #[test]
    fn second_open_of_same_directory_fails() {
        let dir = tempdir().expect("tempdir");
        let _first = QueueBuilder::<Item>::new(dir.path()).open().expect("first open");
        let second = QueueBuilder::<Item>::new(dir.path()).open();
        assert!(second.is_err());
    }

    #[test]
    fn reopening_with_a_different_chunksize_is_rejected() {
        let dir = tempdir().expect("tempdir");
        {
            let queue = QueueBuilder::<Item>::new(dir.path())
                .chunksize(4)
                .open()
                .expect("first open");
            queue.close().expect("close");
        }

        let err = QueueBuilder::<Item>::new(dir.path())
            .chunksize(8)
            .open()
            .expect_err("chunksize mismatch should be rejected");
        assert!(matches!(err, QueueError::ConfigMismatch { .. }));
    }
}
