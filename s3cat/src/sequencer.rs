//! This module provides the out-of-order chunk reassembly features.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SequencerError {
    /// A producer admitted a chunk at an offset already pending or already flushed.
    #[error("chunk at offset {offset} collides with pending or flushed data (cursor at {cursor})")]
    DuplicateOrOverlap { offset: u64, cursor: u64 },
    /// The consumer rejected a write.
    #[error("consumer write failed: {0}")]
    ConsumerWrite(#[source] io::Error),
    /// The sequencer has failed or has been closed.
    #[error("sequencer is closed")]
    Closed,
    #[error("{pending} chunk(s) left pending at cursor {cursor}")]
    Gap { cursor: u64, pending: usize },
    #[error("expected {expected} bytes but flushed {flushed}")]
    SizeMismatch { expected: u64, flushed: u64 },
}

/// Sequencer's state, as observed between two admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Some chunks are held behind a gap.
    Active,
    /// Every byte seen so far has been flushed.
    ///
    /// This is not terminal, the next admit simply goes on from the cursor.
    Drained,
    /// A consumer write or a contract violation occurred, or the sequencer has been closed.
    Failed,
}

/// Snapshot of the sequencer's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Bytes written to the consumer since sequencing began.
    ///
    /// Once failed on a consumer write, bytes of the chunk being written which the consumer accepted before failing are not counted.
    pub flushed: u64,
    /// Chunks currently held behind a gap.
    pub pending_chunks: usize,
    /// Bytes currently held behind a gap.
    pub pending_bytes: u64,
    /// Highest amount of bytes ever held behind a gap at once.
    pub peak_pending_bytes: u64,
}

#[derive(Debug)]
struct Inner<W> {
    start: u64,
    cursor: u64,
    pending: HashMap<u64, Bytes>,
    pending_bytes: u64,
    peak_pending_bytes: u64,
    sink: W,
}

impl<W: io::Write> Inner<W> {
    fn hold(&mut self, offset: u64, chunk: Bytes) {
        self.pending_bytes += chunk.len() as u64;
        self.peak_pending_bytes = self.peak_pending_bytes.max(self.pending_bytes);
        self.pending.insert(offset, chunk);
    }

    fn take_next(&mut self) -> Option<Bytes> {
        let chunk = self.pending.remove(&self.cursor)?;
        self.pending_bytes -= chunk.len() as u64;
        Some(chunk)
    }

    fn flush(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.sink.write_all(chunk)?;
        self.cursor += chunk.len() as u64;
        Ok(())
    }
}

/// A reassembler of byte chunks admitted in any order by concurrent producers into a single sequential consumer.
///
/// Chunks are tagged with their absolute offset in the logical object. A chunk starting exactly at the write cursor is written straight
/// to the consumer, then every chunk that became contiguous is drained in the same critical section. Any other chunk is held in a pending
/// map until the gap below it is filled. The lock is held across consumer writes, so writes are never interleaved nor reordered.
///
/// The sequencer has no notion of completion: the caller knows when the last chunk has been admitted and then calls
/// [`Sequencer::finish()`] to get the consumer back.
///
/// Look-ahead is not throttled here. Producers must bound how far ahead of the cursor they race, otherwise the pending map grows with them.
///
/// # Example
/// ```
/// # use bytes::Bytes;
/// # use s3cat::Sequencer;
/// let sequencer = Sequencer::new(Vec::new());
///
/// sequencer.admit(4, Bytes::from_static(b"EFGH")).unwrap();
/// assert_eq!(sequencer.cursor(), 0);
///
/// sequencer.admit(0, Bytes::from_static(b"ABCD")).unwrap();
/// assert_eq!(sequencer.cursor(), 8);
///
/// assert_eq!(sequencer.finish(Some(8)).unwrap(), b"ABCDEFGH");
/// ```
#[derive(Debug)]
pub struct Sequencer<W> {
    /// Pending map, write cursor and consumer, as a single unit of shared state.
    inner: Mutex<Inner<W>>,
    /// Fast path to reject admits once failed, without waiting for the lock.
    failed: AtomicBool,
}

impl<W: io::Write> Sequencer<W> {
    /// Create a new `Sequencer` writing to `sink` from offset `0`.
    #[inline]
    pub fn new(sink: W) -> Self {
        Self::with_offset(sink, 0)
    }

    /// Create a new `Sequencer` writing to `sink`, expecting its first chunk at offset `start`.
    pub fn with_offset(sink: W, start: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                start,
                cursor: start,
                pending: HashMap::new(),
                pending_bytes: 0,
                peak_pending_bytes: 0,
                sink,
            }),
            failed: AtomicBool::new(false),
        }
    }

    /// Admit a `chunk` starting at `offset`, then drain every contiguous chunk to the consumer.
    ///
    /// Never waits for another chunk to arrive: a chunk which is not due yet is held and the call returns immediately.
    ///
    /// # Errors
    /// - [`SequencerError::Closed`] when the sequencer has already failed or has been closed, nothing is touched;
    /// - [`SequencerError::DuplicateOrOverlap`] when `offset` is already pending or below the cursor;
    /// - [`SequencerError::ConsumerWrite`] when the consumer rejects a write, the chunk being written is then lost.
    ///
    /// The last two errors are fatal: the sequencer enters its [`State::Failed`] state.
    ///
    /// Collisions are only detected on chunk starts. A chunk starting inside a pending chunk, or a pending chunk starting inside a chunk
    /// being flushed, is left pending below the cursor for good, and only reported as [`SequencerError::Gap`] when finishing.
    pub fn admit(&self, offset: u64, chunk: Bytes) -> Result<(), SequencerError> {
        self.check()?;

        if chunk.is_empty() {
            return Ok(());
        }

        let mut inner = self.lock()?;

        // may have been closed while waiting for the lock
        self.check()?;

        let cursor = inner.cursor;

        if offset < cursor || inner.pending.contains_key(&offset) {
            tracing::debug!("Rejecting chunk at offset {offset} ({} bytes), cursor at {cursor}", chunk.len());

            self.fail();
            return Err(SequencerError::DuplicateOrOverlap { offset, cursor });
        }

        if offset > cursor {
            tracing::trace!("Holding chunk at offset {offset} ({} bytes), cursor at {cursor}", chunk.len());

            inner.hold(offset, chunk);
            return Ok(());
        }

        let mut next = Some(chunk);

        while let Some(chunk) = next {
            self.check()?;

            tracing::trace!("Flushing chunk at offset {} ({} bytes)", inner.cursor, chunk.len());

            inner.flush(&chunk).map_err(|err| {
                self.fail();
                SequencerError::ConsumerWrite(err)
            })?;

            next = inner.take_next();
        }

        Ok(())
    }

    /// Copy `buf` and admit it at `offset`, returning the number of bytes admitted.
    #[inline]
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, SequencerError> {
        self.admit(offset, Bytes::copy_from_slice(buf))?;
        Ok(buf.len())
    }

    /// Mark this sequencer as failed so that pending and future admits short-circuit.
    ///
    /// An admit currently draining stops before its next consumer write.
    pub fn close(&self) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Closing sequencer");
        }
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> State {
        if self.is_failed() {
            return State::Failed;
        }

        match self.inner.lock() {
            Ok(inner) if inner.pending.is_empty() => State::Drained,
            Ok(_) => State::Active,
            Err(_) => State::Failed,
        }
    }

    /// Offset of the next byte the consumer expects.
    #[inline]
    pub fn cursor(&self) -> u64 {
        self.peek().cursor
    }

    pub fn stats(&self) -> Stats {
        let inner = self.peek();

        Stats {
            flushed: inner.cursor - inner.start,
            pending_chunks: inner.pending.len(),
            pending_bytes: inner.pending_bytes,
            peak_pending_bytes: inner.peak_pending_bytes,
        }
    }

    /// Consume this sequencer and give the consumer back.
    ///
    /// When `expected_len` is given, the number of flushed bytes must match it, so that a truncated transfer is not mistaken for a
    /// complete one.
    pub fn finish(self, expected_len: Option<u64>) -> Result<W, SequencerError> {
        if self.is_failed() {
            return Err(SequencerError::Closed);
        }

        let inner = self.inner.into_inner().map_err(|_| SequencerError::Closed)?;

        if !inner.pending.is_empty() {
            return Err(SequencerError::Gap {
                cursor: inner.cursor,
                pending: inner.pending.len(),
            });
        }

        let flushed = inner.cursor - inner.start;

        match expected_len {
            Some(expected) if expected != flushed => Err(SequencerError::SizeMismatch { expected, flushed }),
            _ => Ok(inner.sink),
        }
    }

    #[inline]
    fn check(&self) -> Result<(), SequencerError> {
        if self.is_failed() {
            Err(SequencerError::Closed)
        } else {
            Ok(())
        }
    }

    #[inline]
    fn fail(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Lock the shared state for admitting, a poisoned lock meaning a consumer panicked while writing.
    fn lock(&self) -> Result<MutexGuard<'_, Inner<W>>, SequencerError> {
        self.inner.lock().map_err(|_| {
            self.fail();
            SequencerError::Closed
        })
    }

    /// Lock the shared state for reading only.
    fn peek(&self) -> MutexGuard<'_, Inner<W>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
