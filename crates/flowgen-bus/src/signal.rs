//! Data-available signaling between a stream's writer and reader.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Inner {
    version: u64,
    eof: bool,
}

/// Condition-variable channel a writer uses to wake the reader.
///
/// The version counter makes notifications level-triggered: a reader
/// snapshots the version before checking storage, and a wait returns
/// immediately if anything was published in between, so no wakeup can
/// be lost to the check-then-wait race.
#[derive(Debug, Default)]
pub struct SignalChannel {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl SignalChannel {
    /// Creates a channel with no data published and no end of stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Announces that new data is available.
    pub fn notify(&self) {
        let mut inner = self.inner.lock();
        inner.version += 1;
        drop(inner);
        self.cond.notify_all();
    }

    /// Marks in-process end of data and wakes all waiters.
    pub fn set_eof(&self) {
        let mut inner = self.inner.lock();
        inner.eof = true;
        drop(inner);
        self.cond.notify_all();
    }

    /// Clears a stale end-of-data mark, for append-resume.
    pub fn clear_eof(&self) {
        let mut inner = self.inner.lock();
        inner.eof = false;
        inner.version += 1;
        drop(inner);
        self.cond.notify_all();
    }

    /// Returns `true` once end of data has been marked.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.inner.lock().eof
    }

    /// Snapshot of the publish counter, taken before checking storage.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Waits until the version advances past `seen`, end of data is
    /// marked, or `timeout` passes. Returns `true` if woken by either
    /// event, `false` on timeout.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.version > seen || inner.eof {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return inner.version > seen || inner.eof;
            }
            if inner.version > seen || inner.eof {
                return true;
            }
        }
    }
}
