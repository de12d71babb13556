//! Stream bus traits: the contract between nodes and I/O endpoints.
//!
//! A stream is an addressable I/O endpoint identified by a URI. It hands
//! out reader and writer handles, records a seal marker once fully
//! written, and supports random-access positioning by logical record
//! index for resume.

use std::time::Duration;

use crate::config::WriterConfig;
use crate::error::StreamError;
use crate::record::Envelope;

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created but not opened by any node.
    Unopened,
    /// Open for reading or writing.
    Open,
    /// Fully written and sealed; readers drain and then see end of
    /// stream.
    Sealed,
}

/// An addressable stream endpoint.
///
/// Implementations are shared between the producing and consuming node
/// (`Arc<dyn DataStream>`), so all methods take `&self`; interior state
/// is the implementation's concern. At most one writer may be active at
/// a time.
pub trait DataStream: Send + Sync {
    /// The URI scheme this stream was resolved from (`jsonl`, `csv`,
    /// `memory`, ...).
    fn scheme(&self) -> &'static str;

    /// The full URI identifying this stream.
    fn uri(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> StreamState;

    /// Opens the stream, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] on filesystem failure.
    fn open(&self) -> Result<(), StreamError>;

    /// Returns a reader positioned so the next read yields the record
    /// at logical ordinal `offset`.
    ///
    /// The first record read is verified against the offset: anchors
    /// are strictly increasing, so the record at ordinal `offset` must
    /// carry an anchor of at least `offset`; a smaller anchor fails
    /// with [`StreamError::CheckpointMismatch`].
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] if the payload cannot be opened.
    fn reader_at(&self, offset: u64) -> Result<Box<dyn RecordReader>, StreamError>;

    /// Returns the stream's writer handle.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::WriterBusy`] if a writer is already
    /// active, or [`StreamError::Sealed`] if the stream is sealed.
    fn writer(&self, config: &WriterConfig) -> Result<Box<dyn RecordWriter>, StreamError>;

    /// Records the durable seal marker: the stream is fully written.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] on filesystem failure.
    fn seal(&self) -> Result<(), StreamError>;

    /// Removes the seal marker to allow append-resume, and clears any
    /// stale in-process end-of-data signal.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] on filesystem failure.
    fn unseal(&self) -> Result<(), StreamError>;

    /// Deletes the payload and the seal marker.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] on filesystem failure.
    fn clear(&self) -> Result<(), StreamError>;

    /// The number of records physically present.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] if the payload cannot be scanned.
    fn record_count(&self) -> Result<u64, StreamError>;

    /// Marks in-process end of data without writing a durable seal.
    ///
    /// Used for static boundary inputs (a complete file supplied by the
    /// caller) so readers do not wait for a producer that will never
    /// arrive.
    fn mark_eof(&self);
}

/// Reading side of a stream.
pub trait RecordReader: Send {
    /// Reads the next batch of up to `max_records` records.
    ///
    /// An empty result means the stream is sealed and drained. If the
    /// stream is unsealed and no data is available the call blocks; with
    /// `timeout` set it fails instead once that much time has passed
    /// with nothing read.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::TimeoutExceeded`] on timeout,
    /// [`StreamError::CheckpointMismatch`] if resume verification
    /// fails, or [`StreamError::Io`] / [`StreamError::Malformed`] on
    /// payload failure.
    fn read_batch(
        &mut self,
        max_records: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<Envelope>, StreamError>;

    /// Number of records consumed so far, including any resume offset;
    /// equivalently, the ordinal of the next unread record.
    fn progress(&self) -> u64;

    /// Releases the reader.
    fn close(&mut self);
}

/// Writing side of a stream. Append-only: prior records are never
/// rewritten.
pub trait RecordWriter: Send {
    /// Appends a batch of boxed records.
    ///
    /// In async mode this enqueues onto the bounded write queue and
    /// blocks while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] on physical write failure.
    fn write_batch(&mut self, batch: Vec<Envelope>) -> Result<(), StreamError>;

    /// Flushes buffered records, waits for the background worker to
    /// exit, and signals in-process end of data. Sealing the stream is
    /// the owning node's decision, not the writer's.
    ///
    /// # Errors
    ///
    /// Returns the first deferred write error from the background
    /// worker, if any.
    fn close(&mut self) -> Result<(), StreamError>;
}

impl std::fmt::Debug for dyn RecordWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn RecordWriter")
    }
}
