//! The stream writer: synchronous appends or the asynchronous batch
//! writer with a bounded queue and a single background flush worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use flowgen_core::{Envelope, RecordWriter, StreamError, WriterConfig};

use crate::signal::SignalChannel;
use crate::storage::RecordStorage;

enum Mode {
    Sync,
    Async {
        tx: Option<Sender<Envelope>>,
        worker: Option<JoinHandle<Result<(), StreamError>>>,
    },
}

/// Writer over a [`RecordStorage`] plus its [`SignalChannel`].
///
/// In async mode, `write_batch` enqueues records onto a bounded channel
/// of `queue_size` capacity; a full channel blocks the producer, which
/// is the sole mechanism bounding memory end to end. The background
/// worker drains the channel and performs one physical append per
/// accumulated flush.
pub struct StreamWriter {
    storage: Arc<dyn RecordStorage>,
    signal: Arc<SignalChannel>,
    mode: Mode,
    active: Arc<AtomicBool>,
    closed: bool,
}

impl StreamWriter {
    /// Creates a writer. `active` is the owning stream's single-writer
    /// latch, released when this writer closes.
    #[must_use]
    pub fn new(
        storage: Arc<dyn RecordStorage>,
        signal: Arc<SignalChannel>,
        config: &WriterConfig,
        active: Arc<AtomicBool>,
    ) -> Self {
        let mode = if config.async_mode {
            let (tx, rx) = bounded::<Envelope>(config.queue_size.max(1));
            let worker_storage = Arc::clone(&storage);
            let worker_signal = Arc::clone(&signal);
            let cfg = config.clone();
            let worker = std::thread::spawn(move || {
                flush_worker(&rx, worker_storage.as_ref(), &worker_signal, &cfg)
            });
            tracing::debug!(
                "async writer started (queue={}, flush_batch={}, flush_interval={}ms)",
                config.queue_size.max(1),
                config.flush_batch_size,
                config.flush_interval_ms
            );
            Mode::Async {
                tx: Some(tx),
                worker: Some(worker),
            }
        } else {
            Mode::Sync
        };
        Self {
            storage,
            signal,
            mode,
            active,
            closed: false,
        }
    }
}

/// Drains the bounded queue, accumulating until `flush_batch_size`
/// records arrived or `flush_interval` elapsed, then performs one
/// physical append.
fn flush_worker(
    rx: &Receiver<Envelope>,
    storage: &dyn RecordStorage,
    signal: &SignalChannel,
    config: &WriterConfig,
) -> Result<(), StreamError> {
    let flush_interval = Duration::from_millis(config.flush_interval_ms.max(1));
    let retry = Duration::from_millis(config.retry_interval_ms.max(1));

    loop {
        let first = match rx.recv_timeout(retry) {
            Ok(env) => env,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        };

        let mut batch = vec![first];
        let deadline = Instant::now() + flush_interval;
        let mut disconnected = false;
        while batch.len() < config.flush_batch_size.max(1) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(env) => batch.push(env),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        storage.append(&batch)?;
        signal.notify();

        if disconnected {
            return Ok(());
        }
    }
}

impl RecordWriter for StreamWriter {
    fn write_batch(&mut self, batch: Vec<Envelope>) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::Sealed("writer is closed".into()));
        }
        match &self.mode {
            Mode::Sync => {
                self.storage.append(&batch)?;
                self.signal.notify();
                Ok(())
            }
            Mode::Async { tx: Some(tx), .. } => {
                for env in batch {
                    let env = match tx.try_send(env) {
                        Ok(()) => continue,
                        Err(crossbeam_channel::TrySendError::Full(env)) => {
                            // Informational only: a full queue blocking
                            // the producer is the backpressure working.
                            tracing::trace!("write queue full, producer blocking");
                            env
                        }
                        Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                            return Err(StreamError::Io(std::io::Error::other(
                                "async writer terminated",
                            )));
                        }
                    };
                    if tx.send(env).is_err() {
                        return Err(StreamError::Io(std::io::Error::other(
                            "async writer terminated",
                        )));
                    }
                }
                Ok(())
            }
            Mode::Async { tx: None, .. } => {
                Err(StreamError::Sealed("writer is closed".into()))
            }
        }
    }

    fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = match &mut self.mode {
            Mode::Sync => Ok(()),
            Mode::Async { tx, worker } => {
                // Disconnect the queue; the worker drains what is left
                // and exits.
                drop(tx.take());
                match worker.take().map(JoinHandle::join) {
                    Some(Ok(result)) => result,
                    Some(Err(_)) => Err(StreamError::Io(std::io::Error::other(
                        "async writer panicked",
                    ))),
                    None => Ok(()),
                }
            }
        };

        self.signal.set_eof();
        self.active.store(false, Ordering::SeqCst);
        result
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("async", &matches!(self.mode, Mode::Async { .. }))
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use flowgen_core::Record;

    fn env(anchor: u64) -> Envelope {
        Envelope::new(anchor, Record::new().with("v", anchor))
    }

    fn make_writer(storage: Arc<MemoryStorage>, config: &WriterConfig) -> StreamWriter {
        StreamWriter::new(
            storage,
            Arc::new(SignalChannel::new()),
            config,
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[test]
    fn test_sync_write_is_immediate() {
        let storage = Arc::new(MemoryStorage::new());
        let mut writer = make_writer(Arc::clone(&storage), &WriterConfig::default());

        writer.write_batch(vec![env(0), env(1)]).unwrap();
        assert_eq!(storage.len().unwrap(), 2);
        writer.close().unwrap();
    }

    #[test]
    fn test_async_write_lands_after_close() {
        let storage = Arc::new(MemoryStorage::new());
        let config = WriterConfig {
            async_mode: true,
            queue_size: 64,
            flush_batch_size: 10,
            flush_interval_ms: 50,
            retry_interval_ms: 5,
        };
        let mut writer = make_writer(Arc::clone(&storage), &config);

        for i in 0..25 {
            writer.write_batch(vec![env(i)]).unwrap();
        }
        writer.close().unwrap();
        assert_eq!(storage.len().unwrap(), 25);
    }

    #[test]
    fn test_async_flush_by_interval() {
        let storage = Arc::new(MemoryStorage::new());
        let config = WriterConfig {
            async_mode: true,
            queue_size: 64,
            flush_batch_size: 1000,
            flush_interval_ms: 20,
            retry_interval_ms: 5,
        };
        let mut writer = make_writer(Arc::clone(&storage), &config);

        writer.write_batch(vec![env(0)]).unwrap();
        // Far below flush_batch_size: only the interval can flush it
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(storage.len().unwrap(), 1);
        writer.close().unwrap();
    }

    #[test]
    fn test_close_releases_active_latch() {
        let storage = Arc::new(MemoryStorage::new());
        let active = Arc::new(AtomicBool::new(true));
        let mut writer = StreamWriter::new(
            storage,
            Arc::new(SignalChannel::new()),
            &WriterConfig::default(),
            Arc::clone(&active),
        );
        writer.close().unwrap();
        assert!(!active.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_after_close_fails() {
        let storage = Arc::new(MemoryStorage::new());
        let mut writer = make_writer(storage, &WriterConfig::default());
        writer.close().unwrap();
        assert!(writer.write_batch(vec![env(0)]).is_err());
    }

    #[test]
    fn test_close_sets_eof_signal() {
        let storage = Arc::new(MemoryStorage::new());
        let signal = Arc::new(SignalChannel::new());
        let mut writer = StreamWriter::new(
            storage,
            Arc::clone(&signal),
            &WriterConfig::default(),
            Arc::new(AtomicBool::new(true)),
        );
        writer.close().unwrap();
        assert!(signal.is_eof());
    }
}
