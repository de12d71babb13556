//! The node execution container and its batch engines.
//!
//! A node owns one operator, binds one input and one output stream, and
//! drives the loop: read batch, invoke operator, write batch, checkpoint.
//! Two engines are provided:
//!
//! - sequential: one batch at a time on the calling thread
//! - parallel: a dispatcher feeding a worker pool, with a dedicated
//!   writer restoring dispatch order
//!
//! The durable checkpoint advances at read/dispatch time: once a batch is
//! handed to the engine its input records are considered consumed, so no
//! operator invocation is ever repeated across a resume. Batches in
//! flight at a crash are the at-most-once loss window.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;

use crate::config::WriterConfig;
use crate::context::NodeContext;
use crate::error::NodeError;
use crate::operator::{BatchAdapter, Operator};
use crate::record::Envelope;
use crate::status::Status;
use crate::stream::{DataStream, RecordReader, RecordWriter};

/// A point-in-time view of a node, used for manifests and reporting.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// The node's id.
    pub node_id: String,
    /// Current status.
    pub status: Status,
    /// Durable progress: input records consumed.
    pub progress: u64,
    /// Input URI, if bound.
    pub input_uri: Option<String>,
    /// Output URI, if bound.
    pub output_uri: Option<String>,
    /// Records per batch.
    pub batch_size: usize,
    /// Worker pool size.
    pub parallel_size: usize,
}

/// The execution container for one operator.
pub struct Node {
    node_id: String,
    operator: Operator,
    batch_size: usize,
    parallel_size: usize,
    writer_config: WriterConfig,
    read_timeout: Option<Duration>,
    static_input: bool,
    input: Option<Arc<dyn DataStream>>,
    output: Option<Arc<dyn DataStream>>,
    status: Status,
    progress: u64,
    total: Option<u64>,
    resume_progress: Option<u64>,
    ctx: Option<Arc<NodeContext>>,
    adapter: Option<BatchAdapter>,
    reader: Option<Box<dyn RecordReader>>,
    writer: Option<Box<dyn RecordWriter>>,
}

impl Node {
    /// Creates a node. `batch_size` and `parallel_size` must be >= 1;
    /// `parallel_size > 1` selects the parallel engine.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        operator: Operator,
        batch_size: usize,
        parallel_size: usize,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            operator,
            batch_size: batch_size.max(1),
            parallel_size: parallel_size.max(1),
            writer_config: WriterConfig::default(),
            read_timeout: None,
            static_input: false,
            input: None,
            output: None,
            status: Status::Pending,
            progress: 0,
            total: None,
            resume_progress: None,
            ctx: None,
            adapter: None,
            reader: None,
            writer: None,
        }
    }

    /// The node's id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Durable progress: input records consumed so far.
    #[must_use]
    pub fn progress(&self) -> u64 {
        self.progress
    }

    /// Binds the input and output streams.
    pub fn bind_io(&mut self, input: Arc<dyn DataStream>, output: Arc<dyn DataStream>) {
        self.input = Some(input);
        self.output = Some(output);
    }

    /// Sets the writer strategy for the output stream.
    pub fn set_writer_config(&mut self, config: WriterConfig) {
        self.writer_config = config;
    }

    /// Sets a read timeout so the node cannot hang on a dead producer.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Marks the input as a static, externally complete file. Readers
    /// then treat end of payload as end of stream instead of waiting for
    /// a producer.
    pub fn set_static_input(&mut self, yes: bool) {
        self.static_input = yes;
    }

    /// Injects durable state before `open`, when resuming from a
    /// manifest. A node restored as `Completed` is skipped by the
    /// runner; anything else (including a prior failure) is rerun from
    /// its durable progress.
    pub fn restore(&mut self, progress: u64, status: Status) {
        self.progress = progress;
        self.resume_progress = Some(progress);
        self.status = match status {
            Status::Completed => Status::Completed,
            _ => Status::Resuming,
        };
    }

    /// Returns a point-in-time view of the node.
    #[must_use]
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node_id: self.node_id.clone(),
            status: self.status,
            progress: self.progress,
            input_uri: self.input.as_ref().map(|s| s.uri().to_string()),
            output_uri: self.output.as_ref().map(|s| s.uri().to_string()),
            batch_size: self.batch_size,
            parallel_size: self.parallel_size,
        }
    }

    /// Opens streams and binds the operator adapter.
    ///
    /// The output is unsealed first: on resume a stale seal from the
    /// prior run would make downstream readers see end of stream before
    /// this node produced anything.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Stream`] if a stream cannot be opened.
    pub fn open(&mut self, ctx: Arc<NodeContext>) -> Result<(), NodeError> {
        let input = self.input.clone().ok_or(NodeError::NotOpen)?;
        let output = self.output.clone().ok_or(NodeError::NotOpen)?;

        let resume = self.resume_progress.unwrap_or(0);
        self.status = if resume > 0 { Status::Resuming } else { Status::Running };

        // An I/O failure while opening is a terminal failure, same as
        // one during the run; the status must never stay Running for a
        // node that will not run.
        if let Err(e) = self.open_io(&input, &output, resume) {
            self.status = Status::Failed;
            return Err(e);
        }
        self.progress = resume;

        ctx.report_progress(self.progress, self.total);
        self.ctx = Some(ctx);

        tracing::info!(
            "[{}] node open (resume={}, total={:?})",
            self.node_id,
            resume,
            self.total
        );
        Ok(())
    }

    /// The fallible part of `open`: stream activation and handle
    /// binding.
    fn open_io(
        &mut self,
        input: &Arc<dyn DataStream>,
        output: &Arc<dyn DataStream>,
        resume: u64,
    ) -> Result<(), NodeError> {
        input.open()?;
        if self.static_input {
            input.mark_eof();
        }
        output.unseal()?;
        output.open()?;

        self.adapter = Some(BatchAdapter::bind(self.operator.clone(), self.parallel_size > 1));
        self.reader = Some(input.reader_at(resume)?);
        self.writer = Some(output.writer(&self.writer_config)?);
        self.total = input.record_count().ok().filter(|&n| n > 0);
        Ok(())
    }

    /// Requests cancellation: a running node drains its in-flight
    /// batches and exits; one that never started is canceled outright.
    pub fn cancel(&mut self) {
        match self.status {
            Status::Running | Status::Resuming => self.status = Status::Canceling,
            Status::Pending => self.status = Status::Canceled,
            _ => {}
        }
    }

    /// Drives the engine until the input is drained, a failure occurs,
    /// or the node is canceled. Always closes the node on exit.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Canceled`] on cancellation, or the first
    /// operator/stream failure.
    pub fn run(&mut self) -> Result<(), NodeError> {
        if self.reader.is_none() || self.writer.is_none() || self.ctx.is_none() {
            return Err(NodeError::NotOpen);
        }

        let result = if self.parallel_size > 1 {
            self.run_parallel()
        } else {
            self.run_sequential()
        };

        // A drained input does not mean completion if the pipeline was
        // canceled meanwhile: the upstream's end-of-data may itself be
        // the product of that cancel, and sealing here would make a
        // resume skip this node over partial input.
        let cancelled = self
            .ctx
            .as_ref()
            .is_some_and(|ctx| ctx.cancel_token().is_cancelled());
        self.status = match &result {
            Ok(()) if self.status == Status::Canceling || cancelled => Status::Canceled,
            Ok(()) => Status::Completed,
            Err(NodeError::Canceled) => Status::Canceled,
            Err(_) => Status::Failed,
        };

        let close_result = self.close();
        match (result, close_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => {
                self.status = Status::Failed;
                Err(e)
            }
            (Err(e), _) => Err(e),
        }
    }

    /// Closes the writer (flushing any async queue), the reader, and
    /// seals the output only if the node completed. Runs on every exit
    /// path.
    ///
    /// # Errors
    ///
    /// Returns the writer's deferred flush error, if any.
    pub fn close(&mut self) -> Result<(), NodeError> {
        let mut first_err: Option<NodeError> = None;

        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.close() {
                first_err.get_or_insert(NodeError::Stream(e));
            }
        }
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
        if self.status == Status::Completed {
            if let Some(output) = &self.output {
                if let Err(e) = output.seal() {
                    first_err.get_or_insert(NodeError::Stream(e));
                }
            }
        }
        if let Some(ctx) = &self.ctx {
            let total = self.total.map(|t| t.max(self.progress));
            ctx.report_progress(self.progress, total);
        }

        tracing::info!("[{}] node closed ({})", self.node_id, self.status);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sequential engine: read, checkpoint, invoke, write.
    fn run_sequential(&mut self) -> Result<(), NodeError> {
        let ctx = Arc::clone(self.ctx.as_ref().ok_or(NodeError::NotOpen)?);
        loop {
            if ctx.is_cancelled() {
                self.status = Status::Canceling;
                return Err(NodeError::Canceled);
            }
            let reader = self.reader.as_mut().ok_or(NodeError::NotOpen)?;
            let batch = reader.read_batch(self.batch_size, self.read_timeout)?;
            if batch.is_empty() {
                return Ok(());
            }
            self.status = Status::Running;

            // At-most-once: a batch that has been read is consumed, even
            // if the process dies before it is written.
            let consumed = reader.progress();
            self.progress = consumed;
            if self.total.is_some_and(|t| consumed > t) {
                self.total = Some(consumed);
            }
            ctx.persist_checkpoint(consumed);
            ctx.report_progress(consumed, self.total);

            let first = batch[0].anchor;
            let last = batch[batch.len() - 1].anchor;
            tracing::debug!(
                "[{}] batch of {} (anchors {first}..={last})",
                self.node_id,
                batch.len()
            );

            let adapter = self.adapter.as_ref().ok_or(NodeError::NotOpen)?;
            let out = adapter.apply(batch, &ctx)?;
            if !out.is_empty() {
                let writer = self.writer.as_mut().ok_or(NodeError::NotOpen)?;
                writer.write_batch(out)?;
            }
        }
    }

    /// Parallel engine: a dispatcher feeds `parallel_size` workers
    /// through a bounded job channel (the in-flight cap), and a writer
    /// thread restores dispatch order so output anchors stay strictly
    /// increasing.
    #[allow(clippy::too_many_lines)]
    fn run_parallel(&mut self) -> Result<(), NodeError> {
        struct Job {
            seq: u64,
            consumed: u64,
            batch: Vec<Envelope>,
        }
        struct Done {
            seq: u64,
            consumed: u64,
            result: Result<Vec<Envelope>, NodeError>,
        }

        let ctx = Arc::clone(self.ctx.as_ref().ok_or(NodeError::NotOpen)?);
        let adapter = self.adapter.as_ref().ok_or(NodeError::NotOpen)?;
        let mut reader = self.reader.take().ok_or(NodeError::NotOpen)?;
        let mut writer = self.writer.take().ok_or(NodeError::NotOpen)?;

        let parallel = self.parallel_size;
        let batch_size = self.batch_size;
        let read_timeout = self.read_timeout;
        let total = self.total;
        let node_id = self.node_id.clone();

        // Set when the writer thread stops consuming; dispatch must stop
        // too or the whole pool wedges on full channels.
        let failed = Arc::new(AtomicBool::new(false));

        let mut dispatch_err: Option<NodeError> = None;
        let mut canceled = false;
        let mut dispatched: u64 = 0;
        let mut consumed_total: u64 = self.progress;

        let (reader_back, joined) = std::thread::scope(|scope| {
            let (job_tx, job_rx) = bounded::<Job>(parallel);
            let (done_tx, done_rx) = bounded::<Done>(parallel * 2);

            for _ in 0..parallel {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let ctx = Arc::clone(&ctx);
                scope.spawn(move || {
                    for job in job_rx.iter() {
                        let result = adapter.apply(job.batch, &ctx);
                        let done = Done {
                            seq: job.seq,
                            consumed: job.consumed,
                            result,
                        };
                        if done_tx.send(done).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(done_tx);

            let write_failed = Arc::clone(&failed);
            let write_ctx = Arc::clone(&ctx);
            let writer_handle = scope.spawn(move || {
                let mut pending: BTreeMap<u64, Done> = BTreeMap::new();
                let mut next: u64 = 0;
                let mut result: Result<(), NodeError> = Ok(());
                'recv: for done in done_rx.iter() {
                    // A second interrupt means forced termination:
                    // dropping completed-but-unwritten batches is
                    // permitted data loss.
                    if write_ctx.cancel_token().is_forced() {
                        for _ in done_rx.iter() {}
                        break;
                    }
                    pending.insert(done.seq, done);
                    while let Some(ready) = pending.remove(&next) {
                        match ready.result.and_then(|out| {
                            if out.is_empty() {
                                Ok(())
                            } else {
                                writer.write_batch(out).map_err(NodeError::Stream)
                            }
                        }) {
                            Ok(()) => {
                                write_ctx.report_progress(ready.consumed, total);
                                next += 1;
                            }
                            Err(e) => {
                                result = Err(e);
                                write_failed.store(true, Ordering::SeqCst);
                                // Keep draining so workers never block on
                                // a full result channel.
                                for _ in done_rx.iter() {}
                                break 'recv;
                            }
                        }
                    }
                }
                (writer, result)
            });

            loop {
                if failed.load(Ordering::SeqCst) {
                    break;
                }
                if ctx.is_cancelled() {
                    canceled = true;
                    break;
                }
                let batch = match reader.read_batch(batch_size, read_timeout) {
                    Ok(batch) => batch,
                    Err(e) => {
                        dispatch_err = Some(NodeError::Stream(e));
                        break;
                    }
                };
                if batch.is_empty() {
                    break;
                }

                // At-most-once: dispatch is the point of consumption.
                let consumed = reader.progress();
                consumed_total = consumed;
                ctx.persist_checkpoint(consumed);

                let job = Job {
                    seq: dispatched,
                    consumed,
                    batch,
                };
                if job_tx.send(job).is_err() {
                    break;
                }
                dispatched += 1;
            }
            drop(job_tx);

            (reader, writer_handle.join().map_err(|_| ()))
        });

        self.reader = Some(reader_back);
        self.progress = consumed_total;

        let write_result = match joined {
            Ok((writer_back, result)) => {
                self.writer = Some(writer_back);
                result
            }
            Err(()) => Err(NodeError::WorkerPanic),
        };

        if canceled {
            self.status = Status::Canceling;
            tracing::info!("[{node_id}] parallel engine canceled after {dispatched} batches");
            return Err(NodeError::Canceled);
        }
        if let Some(e) = dispatch_err {
            return Err(e);
        }
        write_result
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id)
            .field("status", &self.status)
            .field("progress", &self.progress)
            .field("batch_size", &self.batch_size)
            .field("parallel_size", &self.parallel_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{OperatorError, StreamError};
    use crate::record::Record;
    use crate::stream::StreamState;
    use parking_lot::Mutex;

    /// Minimal in-memory stream for exercising the engines without the
    /// bus crate.
    #[derive(Default)]
    struct TestStream {
        uri: String,
        data: Arc<Mutex<Vec<Envelope>>>,
        sealed: Arc<AtomicBool>,
        fail_open: bool,
    }

    impl TestStream {
        fn with_values(uri: &str, values: &[u64]) -> Arc<Self> {
            let data = values
                .iter()
                .enumerate()
                .map(|(i, &v)| Envelope::new(i as u64, Record::new().with("v", v)))
                .collect();
            Arc::new(Self {
                uri: uri.to_string(),
                data: Arc::new(Mutex::new(data)),
                sealed: Arc::new(AtomicBool::new(true)),
                fail_open: false,
            })
        }

        fn empty(uri: &str) -> Arc<Self> {
            Arc::new(Self {
                uri: uri.to_string(),
                ..Self::default()
            })
        }

        fn anchors(&self) -> Vec<u64> {
            self.data.lock().iter().map(|e| e.anchor).collect()
        }
    }

    struct TestReader {
        data: Arc<Mutex<Vec<Envelope>>>,
        pos: usize,
    }

    impl RecordReader for TestReader {
        fn read_batch(
            &mut self,
            max_records: usize,
            _timeout: Option<Duration>,
        ) -> Result<Vec<Envelope>, StreamError> {
            let data = self.data.lock();
            let end = (self.pos + max_records).min(data.len());
            let batch = data[self.pos..end].to_vec();
            self.pos = end;
            Ok(batch)
        }

        fn progress(&self) -> u64 {
            self.pos as u64
        }

        fn close(&mut self) {}
    }

    struct TestWriter {
        data: Arc<Mutex<Vec<Envelope>>>,
    }

    impl RecordWriter for TestWriter {
        fn write_batch(&mut self, batch: Vec<Envelope>) -> Result<(), StreamError> {
            self.data.lock().extend(batch);
            Ok(())
        }

        fn close(&mut self) -> Result<(), StreamError> {
            Ok(())
        }
    }

    impl DataStream for TestStream {
        fn scheme(&self) -> &'static str {
            "test"
        }
        fn uri(&self) -> &str {
            &self.uri
        }
        fn state(&self) -> StreamState {
            if self.sealed.load(Ordering::SeqCst) {
                StreamState::Sealed
            } else {
                StreamState::Open
            }
        }
        fn open(&self) -> Result<(), StreamError> {
            if self.fail_open {
                return Err(StreamError::Io(std::io::Error::other("open refused")));
            }
            Ok(())
        }
        fn reader_at(&self, offset: u64) -> Result<Box<dyn RecordReader>, StreamError> {
            Ok(Box::new(TestReader {
                data: Arc::clone(&self.data),
                pos: offset as usize,
            }))
        }
        fn writer(&self, _config: &WriterConfig) -> Result<Box<dyn RecordWriter>, StreamError> {
            Ok(Box::new(TestWriter {
                data: Arc::clone(&self.data),
            }))
        }
        fn seal(&self) -> Result<(), StreamError> {
            self.sealed.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn unseal(&self) -> Result<(), StreamError> {
            self.sealed.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn clear(&self) -> Result<(), StreamError> {
            self.data.lock().clear();
            Ok(())
        }
        fn record_count(&self) -> Result<u64, StreamError> {
            Ok(self.data.lock().len() as u64)
        }
        fn mark_eof(&self) {}
    }

    fn times_ten() -> Operator {
        Operator::map(|r| {
            let v = r.get("v").and_then(serde_json::Value::as_u64).unwrap();
            Record::new().with("v", v * 10)
        })
    }

    #[test]
    fn test_sequential_run_to_completion() {
        let input = TestStream::with_values("in", &[1, 2, 3]);
        let output = TestStream::empty("out");

        let mut node = Node::new("node_0", times_ten(), 2, 1);
        node.bind_io(input, output.clone());
        node.open(Arc::new(NodeContext::detached("node_0"))).unwrap();
        node.run().unwrap();

        assert_eq!(node.status(), Status::Completed);
        assert_eq!(node.progress(), 3);
        assert_eq!(output.anchors(), vec![0, 1, 2]);
        assert_eq!(output.state(), StreamState::Sealed);
    }

    #[test]
    fn test_parallel_run_keeps_anchor_order() {
        let values: Vec<u64> = (0..50).collect();
        let input = TestStream::with_values("in", &values);
        let output = TestStream::empty("out");

        let op = Operator::map(|r| {
            let v = r.get("v").and_then(serde_json::Value::as_u64).unwrap();
            // Jittered work so batches complete out of order
            std::thread::sleep(Duration::from_micros(200 * (v % 7)));
            r
        });
        let mut node = Node::new("node_0", op, 5, 4);
        node.bind_io(input, output.clone());
        node.open(Arc::new(NodeContext::detached("node_0"))).unwrap();
        node.run().unwrap();

        assert_eq!(node.status(), Status::Completed);
        let anchors = output.anchors();
        assert_eq!(anchors, (0..50).collect::<Vec<u64>>());
    }

    #[test]
    fn test_operator_failure_marks_node_failed() {
        let input = TestStream::with_values("in", &[1, 2, 3]);
        let output = TestStream::empty("out");

        let op = Operator::batch(
            |_: Vec<Record>, _: &NodeContext| -> Result<crate::operator::BatchOutput, OperatorError> {
                Err(OperatorError::msg("backend unavailable"))
            },
        );
        let mut node = Node::new("node_0", op, 2, 1);
        node.bind_io(input, output.clone());
        node.open(Arc::new(NodeContext::detached("node_0"))).unwrap();

        let err = node.run().unwrap_err();
        assert!(matches!(err, NodeError::Operator { .. }));
        assert_eq!(node.status(), Status::Failed);
        // Failed output must not be sealed
        assert_eq!(output.state(), StreamState::Open);
    }

    #[test]
    fn test_cancel_before_run() {
        let input = TestStream::with_values("in", &[1, 2, 3]);
        let output = TestStream::empty("out");

        let ctx = Arc::new(NodeContext::detached("node_0"));
        ctx.cancel_token().trip();

        let mut node = Node::new("node_0", times_ten(), 1, 1);
        node.bind_io(input, output.clone());
        node.open(Arc::clone(&ctx)).unwrap();

        let err = node.run().unwrap_err();
        assert!(matches!(err, NodeError::Canceled));
        assert_eq!(node.status(), Status::Canceled);
        assert_eq!(output.state(), StreamState::Open);
        assert!(output.anchors().is_empty());
    }

    #[test]
    fn test_resume_skips_consumed_records() {
        let input = TestStream::with_values("in", &[1, 2, 3, 4]);
        let output = TestStream::empty("out");

        let mut node = Node::new("node_0", times_ten(), 2, 1);
        node.bind_io(input, output.clone());
        node.restore(2, Status::Running);
        assert_eq!(node.status(), Status::Resuming);

        node.open(Arc::new(NodeContext::detached("node_0"))).unwrap();
        node.run().unwrap();

        assert_eq!(node.status(), Status::Completed);
        assert_eq!(node.progress(), 4);
        // Only the unconsumed tail was processed
        assert_eq!(output.anchors(), vec![2, 3]);
    }

    #[test]
    fn test_run_requires_open() {
        let mut node = Node::new("node_0", times_ten(), 1, 1);
        assert!(matches!(node.run().unwrap_err(), NodeError::NotOpen));
    }

    #[test]
    fn test_open_failure_marks_node_failed() {
        let input = TestStream::with_values("in", &[1, 2]);
        let output = Arc::new(TestStream {
            uri: "out".to_string(),
            fail_open: true,
            ..TestStream::default()
        });

        let mut node = Node::new("node_0", times_ten(), 1, 1);
        node.bind_io(input, output);

        let err = node.open(Arc::new(NodeContext::detached("node_0"))).unwrap_err();
        assert!(matches!(err, NodeError::Stream(_)));
        assert_eq!(node.status(), Status::Failed);

        // Failed is terminal: a later cancel sweep must not revive it
        // into Canceling
        node.cancel();
        assert_eq!(node.status(), Status::Failed);
    }
}
