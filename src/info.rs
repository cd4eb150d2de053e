//! Atomically checkpointed metadata: the head and tail positions and the logical size, from which
//! the queue can always recover the same state a crash interrupted.
//!
//! The canonical file is named `info` in the queue directory. It is never modified in place: every
//! update writes a full snapshot to a temporary file, `flush`es and `fsync`s it, then `rename`s it
//! over `info`. Rename within a directory is atomic on POSIX and, since Windows 10, on Windows with
//! the appropriate APIs; a reader therefore only ever observes a complete old or new snapshot. On
//! older Windows releases this degrades to best-effort, which is a known limitation of the
//! replace-by-rename approach rather than a bug in this implementation.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    chunk::{ChunkManager, Position, ReadOutcome},
    error::QueueError,
};

const INFO_FILE_NAME: &str = "info";
const INFO_TEMP_FILE_NAME: &str = "info.tmp";

/// On-disk snapshot of everything the queue needs to resume after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InfoSnapshot {
    pub head: Position,
    pub tail: Position,
    pub size: u64,
    pub serializer_version: u32,
    pub chunksize: u32,
}

impl InfoSnapshot {
    pub fn empty(serializer_version: u32, chunksize: u32) -> Self {
        InfoSnapshot {
            head: Position::zero(),
            tail: Position::zero(),
            size: 0,
            serializer_version,
            chunksize,
        }
    }
}

pub(crate) struct InfoStore {
    info_path: PathBuf,
    temp_path: PathBuf,
}

impl InfoStore {
    pub fn new(data_dir: &Path, tempdir: &Path) -> Self {
        Self {
            info_path: data_dir.join(INFO_FILE_NAME),
            temp_path: tempdir.join(INFO_TEMP_FILE_NAME),
        }
    }

    /// Writes `snapshot` via the write-temp / fsync / rename protocol.
    ///
    /// If the rename fails, the previous `info` file is left untouched and the temp file is
    /// removed so a retry starts from a clean slate.
    pub fn persist(&self, snapshot: &InfoSnapshot) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(snapshot)
            .map_err(|e| QueueError::config_mismatch(format!("failed to encode info record: {e}")))?;

        let mut temp = File::create(&self.temp_path)?;
        temp.write_all(&bytes)?;
        temp.flush()?;
        temp.sync_all()?;
        drop(temp);

        match fs::rename(&self.temp_path, &self.info_path) {
            Ok(()) => {
                trace!(head = ?snapshot.head, tail = ?snapshot.tail, size = snapshot.size, "Persisted info record.");
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&self.temp_path);
                Err(e.into())
            }
        }
    }

    fn load_raw(&self) -> Result<Option<InfoSnapshot>, QueueError> {
        match fs::read(&self.info_path) {
            Ok(bytes) => {
                let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
                    QueueError::config_mismatch(format!("failed to decode info record: {e}"))
                })?;
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads the persisted snapshot (if any) and reconciles it against on-disk reality, per the
    /// recovery protocol: a missing info file means a brand new, empty queue; a present one is
    /// trusted unless it references chunks that no longer exist, in which case positions are
    /// recomputed by scanning from the lowest-numbered present chunk.
    pub fn recover(
        &self,
        data_dir: &Path,
        chunk_mgr: &mut ChunkManager,
        serializer_version: u32,
        chunksize: u32,
    ) -> Result<InfoSnapshot, QueueError> {
        let present_chunks = ChunkManager::list_chunk_ids(data_dir)?;

        let Some(loaded) = self.load_raw()? else {
            return Ok(InfoSnapshot::empty(serializer_version, chunksize));
        };

        let finish = |snapshot: InfoSnapshot, chunk_mgr: &mut ChunkManager| {
            chunk_mgr.truncate_to(snapshot.head)?;
            Ok(snapshot)
        };

        if loaded.serializer_version != serializer_version {
            return Err(QueueError::config_mismatch(format!(
                "queue directory was created with serializer version {}, but {} was requested",
                loaded.serializer_version, serializer_version
            )));
        }

        if loaded.chunksize != chunksize {
            return Err(QueueError::config_mismatch(format!(
                "queue directory was created with chunksize {}, but {} was requested",
                loaded.chunksize, chunksize
            )));
        }

        let Some(&lowest_present) = present_chunks.first() else {
            // Info claims chunks exist but the directory holds none: trust it only if it also
            // claims an empty queue, otherwise fall back to a fresh empty state rather than
            // fabricate chunk files that were never there.
            if loaded.size == 0 {
                return finish(
                    InfoSnapshot {
                        head: Position::zero(),
                        tail: Position::zero(),
                        ..loaded
                    },
                    chunk_mgr,
                );
            }
            warn!("Info record references chunks that are all missing; resetting to an empty queue.");
            return finish(InfoSnapshot::empty(serializer_version, chunksize), chunk_mgr);
        };

        let tail_chunk_present = present_chunks.contains(&loaded.tail.chunk_id);
        let head_chunk_present = present_chunks.contains(&loaded.head.chunk_id);

        if tail_chunk_present && head_chunk_present {
            return finish(loaded, chunk_mgr);
        }

        warn!(
            tail_chunk_present,
            head_chunk_present, "Info record out of sync with on-disk chunks; recomputing positions by scan."
        );

        let tail = if tail_chunk_present {
            loaded.tail
        } else {
            Position {
                chunk_id: lowest_present,
                offset: 0,
                count: 0,
            }
        };

        let head = Self::scan_for_head(chunk_mgr, tail)?;
        let size = Self::count_between(chunk_mgr, tail, head)?;

        finish(
            InfoSnapshot {
                head,
                tail,
                size,
                serializer_version,
                chunksize,
            },
            chunk_mgr,
        )
    }

    /// Scans forward from `start` record by record until a torn or missing record is hit, which
    /// marks the true head position after a crash mid-`put`.
    fn scan_for_head(chunk_mgr: &mut ChunkManager, start: Position) -> Result<Position, QueueError> {
        let mut pos = start;
        loop {
            match chunk_mgr.read_at(pos)? {
                ReadOutcome::Record { next, .. } => pos = next,
                ReadOutcome::Incomplete => return Ok(pos),
            }
        }
    }

    fn count_between(
        chunk_mgr: &mut ChunkManager,
        mut tail: Position,
        head: Position,
    ) -> Result<u64, QueueError> {
        let mut count = 0u64;
        while tail != head {
            match chunk_mgr.read_at(tail)? {
                ReadOutcome::Record { next, .. } => {
                    tail = next;
                    count += 1;
                }
                ReadOutcome::Incomplete => break,
            }
        }
        Ok(count)
    }
}
