//! The public queue facade: `put`, `get`, `task_done`, `join`, and the accompanying concurrency
//! discipline.
//!
//! A single [`parking_lot::Mutex`] protects every piece of mutable state -- `size`, the head and
//! tail positions, `outstanding`, and the chunk manager's open write handle -- and disk I/O for
//! `put` and (when `autosave` is set) `get` is performed while that mutex is held. This keeps
//! bytes-on-disk and info-record-on-disk in a single total order: a `put` never advances the
//! in-memory head before the corresponding bytes and info record reach disk in that order. Three
//! condition variables ride along the same mutex: `not_full`, `not_empty`, and `joined`, the last
//! signaled whenever `outstanding` drops to zero.

use std::{
    marker::PhantomData,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    chunk::{ChunkManager, Position, ReadOutcome},
    error::QueueError,
    info::{InfoSnapshot, InfoStore},
    registry::DirectoryGuard,
    serializer::{JsonSerializer, Serializer},
};

struct State {
    head: Position,
    tail: Position,
    size: u64,
    outstanding: u64,
    closed: bool,
    chunk_mgr: ChunkManager,
}

/// A durable, crash-safe FIFO queue backed by a chunked on-disk log.
///
/// `T` is the item type; `S` is the [`Serializer`] used to translate items to and from bytes. A
/// queue is opened via [`crate::QueueBuilder`], never constructed directly, since opening requires
/// validating the configuration against whatever is already on disk.
pub struct Queue<T, S = JsonSerializer<T>> {
    state: Mutex<State>,
    not_full: Condvar,
    not_empty: Condvar,
    joined: Condvar,
    info_store: InfoStore,
    maxsize: u64,
    chunksize: u32,
    autosave: bool,
    serializer: S,
    _directory_guard: DirectoryGuard,
    _marker: PhantomData<fn(T)>,
}

/// How long a blocking operation is willing to wait before giving up.
enum Deadline {
    Forever,
    At(Instant),
}

impl Deadline {
    fn timed_out(&self) -> bool {
        matches!(self, Deadline::At(at) if Instant::now() >= *at)
    }

    fn wait<'a>(&self, condvar: &Condvar, guard: &mut MutexGuard<'a, State>) {
        match self {
            Deadline::Forever => {
                condvar.wait(guard);
            }
            Deadline::At(at) => {
                let now = Instant::now();
                if *at > now {
                    condvar.wait_for(guard, *at - now);
                }
            }
        }
    }
}

impl<T, S> Queue<T, S>
where
    S: Serializer<T>,
{
    pub(crate) fn new(
        info_store: InfoStore,
        chunk_mgr: ChunkManager,
        initial: InfoSnapshot,
        maxsize: u64,
        chunksize: u32,
        autosave: bool,
        serializer: S,
        directory_guard: DirectoryGuard,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                head: initial.head,
                tail: initial.tail,
                size: initial.size,
                outstanding: 0,
                closed: false,
                chunk_mgr,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            joined: Condvar::new(),
            info_store,
            maxsize,
            chunksize,
            autosave,
            serializer,
            _directory_guard: directory_guard,
            _marker: PhantomData,
        }
    }

    /// Enqueues `item`, blocking indefinitely while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Io`] if the item could not be durably written, or
    /// [`QueueError::ProgrammingError`] if the queue has already been closed.
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        self.put_inner(item, &Deadline::Forever)
    }

    /// Enqueues `item` without blocking, failing with [`QueueError::Full`] if the queue is
    /// currently at `maxsize`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] if the queue is at `maxsize`, [`QueueError::Io`] if the item
    /// could not be durably written, or [`QueueError::ProgrammingError`] if the queue has already
    /// been closed.
    pub fn try_put(&self, item: T) -> Result<(), QueueError> {
        let mut guard = self.state.lock();
        self.check_open(&guard)?;
        if self.is_full(&guard) {
            return Err(QueueError::Full);
        }
        self.put_locked(item, &mut guard)
    }

    /// Enqueues `item`, blocking for up to `timeout` while the queue is full before failing with
    /// [`QueueError::Timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Timeout`] if `timeout` elapses while the queue stays full,
    /// [`QueueError::Io`] if the item could not be durably written, or
    /// [`QueueError::ProgrammingError`] if the queue has already been closed.
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError> {
        self.put_inner(item, &Deadline::At(Instant::now() + timeout))
    }

    fn put_inner(&self, item: T, deadline: &Deadline) -> Result<(), QueueError> {
        let mut guard = self.state.lock();
        self.check_open(&guard)?;
        while self.is_full(&guard) {
            if deadline.timed_out() {
                return Err(QueueError::Timeout);
            }
            deadline.wait(&self.not_full, &mut guard);
            self.check_open(&guard)?;
        }
        self.put_locked(item, &mut guard)
    }

    fn put_locked(&self, item: T, guard: &mut MutexGuard<'_, State>) -> Result<(), QueueError> {
        let payload = self.serializer.encode(&item)?;

        let mut head = guard.head;
        guard.chunk_mgr.append(&mut head, &payload)?;
        guard.chunk_mgr.flush(true)?;

        let snapshot = InfoSnapshot {
            head,
            tail: guard.tail,
            size: guard.size + 1,
            serializer_version: S::VERSION,
            chunksize: self.chunksize,
        };
        self.info_store.persist(&snapshot)?;

        guard.head = head;
        guard.size += 1;
        guard.chunk_mgr.reap(guard.tail.chunk_id)?;

        debug!(size = guard.size, "Item enqueued.");
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeues the next item, blocking indefinitely while the queue is empty.
    ///
    /// The item is considered "outstanding" until [`Queue::task_done`] is called for it; if the
    /// process crashes before that, the item is redelivered on the next open unless `autosave` was
    /// enabled, in which case the tail was already durably advanced by this call.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Io`] if the record could not be read back, or
    /// [`QueueError::ProgrammingError`] if the queue has already been closed.
    pub fn get(&self) -> Result<T, QueueError> {
        self.get_inner(&Deadline::Forever)
    }

    /// Dequeues the next item without blocking, failing with [`QueueError::Empty`] if none is
    /// available.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Empty`] if the queue currently holds no items, [`QueueError::Io`] if
    /// the record could not be read back, or [`QueueError::ProgrammingError`] if the queue has
    /// already been closed.
    pub fn try_get(&self) -> Result<T, QueueError> {
        let mut guard = self.state.lock();
        self.check_open(&guard)?;
        if self.is_empty(&guard) {
            return Err(QueueError::Empty);
        }
        self.get_locked(&mut guard)
    }

    /// Dequeues the next item, blocking for up to `timeout` while the queue is empty before
    /// failing with [`QueueError::Timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Timeout`] if `timeout` elapses while the queue stays empty,
    /// [`QueueError::Io`] if the record could not be read back, or
    /// [`QueueError::ProgrammingError`] if the queue has already been closed.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, QueueError> {
        self.get_inner(&Deadline::At(Instant::now() + timeout))
    }

    fn get_inner(&self, deadline: &Deadline) -> Result<T, QueueError> {
        let mut guard = self.state.lock();
        self.check_open(&guard)?;
        while self.is_empty(&guard) {
            if deadline.timed_out() {
                return Err(QueueError::Timeout);
            }
            deadline.wait(&self.not_empty, &mut guard);
            self.check_open(&guard)?;
        }
        self.get_locked(&mut guard)
    }

    fn get_locked(&self, guard: &mut MutexGuard<'_, State>) -> Result<T, QueueError> {
        let (payload, next_tail) = match guard.chunk_mgr.read_at(guard.tail)? {
            ReadOutcome::Record { payload, next } => (payload, next),
            ReadOutcome::Incomplete => {
                // size says there should be a record here; an incomplete read at the tail
                // (outside of recovery, where this is the normal end-of-log signal) means the
                // directory is corrupt rather than merely empty.
                warn!(
                    chunk_id = guard.tail.chunk_id,
                    offset = guard.tail.offset,
                    "Torn record encountered reading at the tail outside of recovery."
                );
                return Err(QueueError::TornRecord {
                    chunk_id: guard.tail.chunk_id,
                    offset: guard.tail.offset,
                });
            }
        };

        let item = self.serializer.decode(&payload)?;

        if self.autosave {
            // Persist before mutating anything in-memory: if this fails, `get` must return with
            // the tail, size, and outstanding count exactly as they were before the call (§7), not
            // with a tail that has silently skipped an item the caller never received.
            let snapshot = InfoSnapshot {
                head: guard.head,
                tail: next_tail,
                size: guard.size - 1,
                serializer_version: S::VERSION,
                chunksize: self.chunksize,
            };
            self.info_store.persist(&snapshot)?;
        }

        guard.tail = next_tail;
        guard.size -= 1;
        guard.outstanding += 1;

        if self.autosave {
            guard.chunk_mgr.reap(guard.tail.chunk_id)?;
        }

        debug!(size = guard.size, outstanding = guard.outstanding, "Item dequeued.");
        self.not_full.notify_one();
        Ok(item)
    }

    /// Confirms that a previously dequeued item has been fully processed.
    ///
    /// If `autosave` is disabled, this is where the tail advance made by the corresponding `get`
    /// (and any that preceded it since the last `task_done`) is durably persisted.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ProgrammingError`] if called when no item is outstanding.
    pub fn task_done(&self) -> Result<(), QueueError> {
        let mut guard = self.state.lock();
        if guard.outstanding == 0 {
            return Err(QueueError::programming_error(
                "task_done called with no outstanding items",
            ));
        }
        guard.outstanding -= 1;

        if !self.autosave {
            let snapshot = InfoSnapshot {
                head: guard.head,
                tail: guard.tail,
                size: guard.size,
                serializer_version: S::VERSION,
                chunksize: self.chunksize,
            };
            self.info_store.persist(&snapshot)?;
            guard.chunk_mgr.reap(guard.tail.chunk_id)?;
        }

        if guard.outstanding == 0 {
            self.joined.notify_all();
        }
        Ok(())
    }

    /// Blocks until every item returned by `get` has been confirmed via `task_done`.
    pub fn join(&self) {
        let mut guard = self.state.lock();
        while guard.outstanding > 0 {
            self.joined.wait(&mut guard);
        }
    }

    /// Returns the current logical size of the queue.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Returns `true` if the queue currently holds no items.
    #[must_use]
    pub fn empty(&self) -> bool {
        self.state.lock().size == 0
    }

    /// Returns `true` if the queue is at `maxsize` (always `false` when `maxsize` is 0).
    #[must_use]
    pub fn full(&self) -> bool {
        let guard = self.state.lock();
        self.is_full(&guard)
    }

    /// Flushes the head chunk, persists the info record, and releases file handles.
    ///
    /// Idempotent: calling `close` on an already-closed queue is a no-op. Best-effort: if flushing
    /// or persisting fails, the error is returned but the queue is still marked closed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Io`] if the final flush or info-record persist fails. The queue is
    /// marked closed and its handles are released regardless.
    pub fn close(&self) -> Result<(), QueueError> {
        let mut guard = self.state.lock();
        if guard.closed {
            return Ok(());
        }
        guard.closed = true;

        let flush_result = guard.chunk_mgr.flush(true);
        let snapshot = InfoSnapshot {
            head: guard.head,
            tail: guard.tail,
            size: guard.size,
            serializer_version: S::VERSION,
            chunksize: self.chunksize,
        };
        let persist_result = self.info_store.persist(&snapshot);

        flush_result?;
        persist_result?;
        Ok(())
    }

    fn is_full(&self, guard: &State) -> bool {
        self.maxsize != 0 && guard.size >= self.maxsize
    }

    fn is_empty(&self, guard: &State) -> bool {
        guard.size == 0
    }

    fn check_open(&self, guard: &State) -> Result<(), QueueError> {
        if guard.closed {
            return Err(QueueError::programming_error("queue has been closed"));
        }
        Ok(())
    }
}

impl<T, S> Drop for Queue<T, S> {
    fn drop(&mut self) {
        let mut guard = self.state.lock();
        if guard.closed {
            return;
        }
        guard.closed = true;
        if let Err(e) = guard.chunk_mgr.flush(true) {
            warn!(error = %e, "Failed to flush chunk log while dropping queue.");
        }
    }
}
