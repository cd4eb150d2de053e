use std::io;

use snafu::Snafu;

/// Error returned by the fallible operations of [`crate::Queue`](crate::Queue).
///
/// This is the sole error type surfaced by the public API: callers match on the variant to decide
/// whether to back off and retry (`Empty`/`Full`/`Timeout`), treat it as a bug in their own usage
/// (`ProgrammingError`), refuse to open the directory at all (`ConfigMismatch`), or propagate an
/// underlying filesystem failure (`Io`).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// `get` was attempted on an empty queue in non-blocking mode, or past its timeout.
    #[snafu(display("queue is empty"))]
    Empty,

    /// `put` was attempted on a full queue in non-blocking mode, or past its timeout.
    #[snafu(display("queue is full (maxsize reached)"))]
    Full,

    /// A blocking `put`/`get`/`join` exceeded its deadline without a state change.
    #[snafu(display("operation timed out"))]
    Timeout,

    /// A record's length prefix claimed more bytes than the chunk file actually contains.
    ///
    /// This is only raised for corruption encountered outside of the head chunk; a torn record at
    /// the head chunk is expected after a crash mid-write and is discarded silently during recovery.
    #[snafu(display(
        "torn record detected in chunk {chunk_id} at offset {offset}: length prefix extends past end of file"
    ))]
    TornRecord { chunk_id: u32, offset: u64 },

    /// An underlying filesystem operation failed.
    ///
    /// In-memory state is rolled back to the pre-call position whenever this occurs on a write-path
    /// or read-path operation.
    #[snafu(display("I/O error: {source}"))]
    Io { source: io::Error },

    /// The queue directory cannot be opened with the requested configuration.
    ///
    /// Raised for an invalid builder parameter, a `chunksize`/serializer mismatch against an
    /// existing queue directory, or an attempt to open a directory that already has a live handle
    /// (in this process or another).
    #[snafu(display("configuration mismatch: {reason}"))]
    ConfigMismatch { reason: String },

    /// The caller violated the queue's usage contract.
    ///
    /// Raised by `task_done` when `outstanding` is already zero, and by any operation attempted on
    /// a queue that has already been closed.
    #[snafu(display("programming error: {reason}"))]
    ProgrammingError { reason: String },
}

impl From<io::Error> for QueueError {
    fn from(source: io::Error) -> Self {
        QueueError::Io { source }
    }
}

impl QueueError {
    pub(crate) fn config_mismatch(reason: impl Into<String>) -> Self {
        QueueError::ConfigMismatch {
            reason: reason.into(),
        }
    }

    pub(crate) fn programming_error(reason: impl Into<String>) -> Self {
        QueueError::ProgrammingError {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error represents ordinary back-pressure (`Empty`, `Full`, or
    /// `Timeout`) rather than a fault, which callers typically handle by retrying rather than
    /// logging as an error.
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, QueueError::Empty | QueueError::Full | QueueError::Timeout)
    }
}
