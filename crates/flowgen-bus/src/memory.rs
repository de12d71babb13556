//! In-memory storage: the unbounded buffer behind `memory://` streams
//! and the bounded consume-on-read buffer behind the streaming bridge.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use flowgen_core::{Envelope, StreamError};

use crate::storage::RecordStorage;

/// Unbounded in-memory record storage.
///
/// Keeps everything it is given and supports repeated random-access
/// reads, mirroring the file backends without touching disk.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<Vec<Envelope>>,
    sealed: AtomicBool,
}

impl MemoryStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStorage for MemoryStorage {
    fn append(&self, batch: &[Envelope]) -> Result<(), StreamError> {
        self.data.lock().extend_from_slice(batch);
        Ok(())
    }

    fn read(&self, offset: u64, limit: usize) -> Result<Vec<Envelope>, StreamError> {
        let data = self.data.lock();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start >= data.len() {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(limit).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn len(&self) -> Result<u64, StreamError> {
        Ok(self.data.lock().len() as u64)
    }

    fn clear(&self) -> Result<(), StreamError> {
        self.data.lock().clear();
        self.sealed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn seal(&self, _record_count: u64) -> Result<(), StreamError> {
        self.sealed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unseal(&self) -> Result<(), StreamError> {
        self.sealed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct BridgeInner {
    base: u64,
    items: VecDeque<Envelope>,
    abandoned: bool,
}

/// Bounded consume-on-read buffer for the streaming bridge.
///
/// Producers block while the buffer is at capacity; a read drains the
/// records it returns, freeing space. This blocking hand-off is what
/// bounds memory between concurrent nodes.
#[derive(Debug)]
pub struct BridgeBuffer {
    inner: Mutex<BridgeInner>,
    space: Condvar,
    capacity: usize,
    sealed: AtomicBool,
}

impl BridgeBuffer {
    /// Creates a buffer holding at most `capacity` records (at least 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BridgeInner::default()),
            space: Condvar::new(),
            capacity: capacity.max(1),
            sealed: AtomicBool::new(false),
        }
    }
}

impl RecordStorage for BridgeBuffer {
    fn append(&self, batch: &[Envelope]) -> Result<(), StreamError> {
        let mut inner = self.inner.lock();
        for env in batch {
            if inner.items.len() >= self.capacity {
                tracing::trace!("bridge at capacity, producer blocking");
            }
            while inner.items.len() >= self.capacity && !inner.abandoned {
                self.space.wait(&mut inner);
            }
            if inner.abandoned {
                return Err(StreamError::Sealed("bridge reader is gone".into()));
            }
            inner.items.push_back(env.clone());
        }
        Ok(())
    }

    fn read(&self, offset: u64, limit: usize) -> Result<Vec<Envelope>, StreamError> {
        let mut inner = self.inner.lock();
        if offset < inner.base {
            // Consumed data is gone; a bridge has exactly one reader and
            // it only ever moves forward.
            tracing::warn!("bridge read at {offset} behind base {}", inner.base);
            return Ok(Vec::new());
        }
        let skip = usize::try_from(offset - inner.base).unwrap_or(usize::MAX);
        if skip >= inner.items.len() {
            return Ok(Vec::new());
        }
        let take = limit.min(inner.items.len() - skip);
        let batch: Vec<Envelope> = inner.items.iter().skip(skip).take(take).cloned().collect();

        // Drop everything up to the end of this read; the records are
        // delivered and will not be asked for again.
        let drained = skip + take;
        inner.items.drain(..drained);
        inner.base += drained as u64;
        drop(inner);
        self.space.notify_all();
        Ok(batch)
    }

    fn len(&self) -> Result<u64, StreamError> {
        let inner = self.inner.lock();
        Ok(inner.base + inner.items.len() as u64)
    }

    fn clear(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.base = 0;
        inner.abandoned = false;
        drop(inner);
        self.sealed.store(false, Ordering::SeqCst);
        self.space.notify_all();
        Ok(())
    }

    fn seal(&self, _record_count: u64) -> Result<(), StreamError> {
        self.sealed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unseal(&self) -> Result<(), StreamError> {
        self.sealed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    fn abandon(&self) {
        let mut inner = self.inner.lock();
        inner.abandoned = true;
        drop(inner);
        self.space.notify_all();
    }
}
