//! The concrete stream endpoint tying a storage backend to its signal
//! channel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowgen_core::{
    DataStream, RecordReader, RecordWriter, StreamError, StreamState, WriterConfig,
};

use crate::csv::CsvStorage;
use crate::jsonl::JsonlStorage;
use crate::memory::{BridgeBuffer, MemoryStorage};
use crate::reader::StreamReader;
use crate::signal::SignalChannel;
use crate::storage::RecordStorage;
use crate::writer::StreamWriter;

/// Poll interval for reader waits and annealing retries.
const READER_POLL: Duration = Duration::from_millis(100);

/// A stream endpoint over any [`RecordStorage`] backend.
///
/// One `BusStream` is shared by the producing and consuming node of a
/// welded edge, so the writer's notifications reach the reader through
/// the common signal channel and the pair supports write-while-read.
pub struct BusStream {
    scheme: &'static str,
    uri: String,
    storage: Arc<dyn RecordStorage>,
    signal: Arc<SignalChannel>,
    opened: AtomicBool,
    active_writer: Arc<AtomicBool>,
}

impl BusStream {
    fn new(scheme: &'static str, uri: String, storage: Arc<dyn RecordStorage>) -> Self {
        Self {
            scheme,
            uri,
            storage,
            signal: Arc::new(SignalChannel::new()),
            opened: AtomicBool::new(false),
            active_writer: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a JSONL-backed stream.
    #[must_use]
    pub fn jsonl(uri: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new("jsonl", uri.into(), Arc::new(JsonlStorage::new(path)))
    }

    /// Creates a CSV-backed stream.
    #[must_use]
    pub fn csv(uri: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new("csv", uri.into(), Arc::new(CsvStorage::new(path)))
    }

    /// Creates an unbounded in-memory stream.
    #[must_use]
    pub fn memory(uri: impl Into<String>) -> Self {
        Self::new("memory", uri.into(), Arc::new(MemoryStorage::new()))
    }

    /// Creates a streaming bridge: a bounded in-memory stream for
    /// adjacent concurrent nodes. Producers block while `capacity`
    /// records are in flight.
    #[must_use]
    pub fn bridge(uri: impl Into<String>, capacity: usize) -> Self {
        Self::new("bridge", uri.into(), Arc::new(BridgeBuffer::new(capacity)))
    }
}

impl DataStream for BusStream {
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn state(&self) -> StreamState {
        if self.storage.is_sealed() {
            StreamState::Sealed
        } else if self.opened.load(Ordering::SeqCst) {
            StreamState::Open
        } else {
            StreamState::Unopened
        }
    }

    fn open(&self) -> Result<(), StreamError> {
        // A stale in-process end-of-data mark from an earlier writer
        // must not outlive reopening; the durable seal is checked
        // separately by readers.
        if !self.storage.is_sealed() {
            self.signal.clear_eof();
        }
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn reader_at(&self, offset: u64) -> Result<Box<dyn RecordReader>, StreamError> {
        Ok(Box::new(StreamReader::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.signal),
            offset,
            READER_POLL,
        )))
    }

    fn writer(&self, config: &WriterConfig) -> Result<Box<dyn RecordWriter>, StreamError> {
        if self.storage.is_sealed() {
            return Err(StreamError::Sealed(self.uri.clone()));
        }
        if self.active_writer.swap(true, Ordering::SeqCst) {
            return Err(StreamError::WriterBusy(self.uri.clone()));
        }
        Ok(Box::new(StreamWriter::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.signal),
            config,
            Arc::clone(&self.active_writer),
        )))
    }

    fn seal(&self) -> Result<(), StreamError> {
        let count = self.storage.len()?;
        self.storage.seal(count)?;
        self.signal.set_eof();
        Ok(())
    }

    fn unseal(&self) -> Result<(), StreamError> {
        self.storage.unseal()?;
        self.signal.clear_eof();
        Ok(())
    }

    fn clear(&self) -> Result<(), StreamError> {
        self.storage.clear()?;
        self.signal.clear_eof();
        Ok(())
    }

    fn record_count(&self) -> Result<u64, StreamError> {
        self.storage.len()
    }

    fn mark_eof(&self) {
        self.signal.set_eof();
    }
}

impl std::fmt::Debug for BusStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusStream")
            .field("scheme", &self.scheme)
            .field("uri", &self.uri)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
