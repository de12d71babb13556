//! The generic stream reader: batched reads over any storage backend,
//! with write-while-read support, resume verification, and zero-progress
//! annealing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flowgen_core::{Envelope, RecordReader, StreamError};

use crate::signal::SignalChannel;
use crate::storage::RecordStorage;

/// How many times an empty-but-finished read at progress zero is
/// retried before it is believed. Defeats the startup race where a
/// downstream reader sees a stale seal the upstream has not torn off
/// yet.
const ZERO_PROGRESS_RETRIES: u32 = 5;

/// Reader over a [`RecordStorage`] plus its [`SignalChannel`].
///
/// Supports reading while the producer is still writing: when no data
/// is available and the stream is unsealed, the reader parks on the
/// signal channel instead of spinning.
pub struct StreamReader {
    storage: Arc<dyn RecordStorage>,
    signal: Arc<SignalChannel>,
    consumed: u64,
    verify_offset: Option<u64>,
    poll_interval: Duration,
}

impl StreamReader {
    /// Creates a reader positioned at `offset`. A non-zero offset arms
    /// resume verification of the first record read.
    #[must_use]
    pub fn new(
        storage: Arc<dyn RecordStorage>,
        signal: Arc<SignalChannel>,
        offset: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            storage,
            signal,
            consumed: offset,
            verify_offset: (offset > 0).then_some(offset),
            poll_interval,
        }
    }

    /// Anchors are strictly increasing non-negative integers, so the
    /// record at ordinal `n` always carries an anchor of at least `n`
    /// (with equality on 1:1 chains). A smaller anchor means the
    /// checkpoint and the payload disagree, and running on would repeat
    /// paid work.
    fn verify(&mut self, first: &Envelope) -> Result<(), StreamError> {
        if let Some(expected) = self.verify_offset.take() {
            if first.anchor < expected {
                return Err(StreamError::CheckpointMismatch {
                    expected,
                    found: first.anchor,
                });
            }
        }
        Ok(())
    }

    fn take(&mut self, batch: Vec<Envelope>) -> Result<Vec<Envelope>, StreamError> {
        if let Some(first) = batch.first() {
            self.verify(first)?;
        }
        self.consumed += batch.len() as u64;
        Ok(batch)
    }

    fn is_finished(&self) -> bool {
        self.storage.is_sealed() || self.signal.is_eof()
    }
}

impl RecordReader for StreamReader {
    fn read_batch(
        &mut self,
        max_records: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<Envelope>, StreamError> {
        let started = Instant::now();
        let mut zero_retries = 0u32;

        loop {
            let seen = self.signal.version();
            let batch = self.storage.read(self.consumed, max_records)?;
            if !batch.is_empty() {
                return self.take(batch);
            }

            if self.is_finished() {
                // Annealing: a finished-looking stream with zero
                // progress is suspicious right after startup; give the
                // upstream a moment to unseal and produce.
                if self.consumed == 0 && zero_retries < ZERO_PROGRESS_RETRIES {
                    zero_retries += 1;
                    std::thread::sleep(self.poll_interval);
                    continue;
                }
                // Drain whatever landed between the read and the check.
                let last = self.storage.read(self.consumed, max_records)?;
                if !last.is_empty() {
                    return self.take(last);
                }
                // A short stream cannot satisfy a pending resume offset.
                if let Some(expected) = self.verify_offset.take() {
                    let available = self.storage.len()?;
                    if available < expected {
                        return Err(StreamError::CheckpointMismatch {
                            expected,
                            found: available,
                        });
                    }
                }
                return Ok(Vec::new());
            }

            if let Some(limit) = timeout {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    return Err(StreamError::TimeoutExceeded {
                        waited_ms: elapsed.as_millis() as u64,
                    });
                }
                let remaining = limit - elapsed;
                self.signal.wait_newer(seen, remaining.min(self.poll_interval));
            } else {
                self.signal.wait_newer(seen, self.poll_interval);
            }
        }
    }

    fn progress(&self) -> u64 {
        self.consumed
    }

    fn close(&mut self) {
        self.storage.abandon();
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("consumed", &self.consumed)
            .field("verify_offset", &self.verify_offset)
            .finish_non_exhaustive()
    }
}
