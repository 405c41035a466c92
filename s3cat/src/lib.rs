//! A simple crate streaming remote objects to a sequential output.
//!
//! A generic, robust and efficient crate providing features dedicated to:
//! - reassembling byte chunks admitted out of order by concurrent producers into a single sequential consumer,
//! - downloading objects over HTTP in parallel byte ranges,
//! - streaming `s3://` or `http(s)://` objects to any blocking writer, such as the standard output.
//!
//! It makes use of a single `Mutex` guarding the whole reassembly state together with an atomic flag to fail fast, `Semaphore`s to limit
//! consumed system resources, and the blocking thread pool to keep blocking writes away from asynchronous tasks.
//!
//! As a **strong hypothesis**, we can assume that:
//! - fetched parts **exactly tile** the object, with no gaps and no overlaps;
//! - the total object size is reported by the server on the first ranged request.
//!
//! Based on this assumption, chunks arriving ahead of the write cursor are held in an in-memory hashmap keyed by their offset, while the
//! chunk matching the cursor is written right away, draining every chunk it made contiguous. The hashmap is only ever probed for the
//! exact cursor offset, so there is no need to keep it ordered.
//!
//! Here is the naive representation of a transfer in its very first version:
//!
//! ```text
//!     part 0 (size discovery)
//!       L parts 1..n, up to `concurrency` in flight, completing in any order
//!         L Sequencer::admit(offset, bytes)   (blocking thread pool)
//!           L pending { offset => bytes }     (held behind a gap)
//!           L sink.write_all(bytes)           (at the cursor, in order)
//! ```
//!
//! Any error, either from a request, a contract violation or the sink, aborts the whole transfer: the sequencer is closed and parts still
//! in flight are discarded, so that a partial output is never taken for a complete one.

mod sequencer;
pub use sequencer::*;

pub mod download;
