//! The pipeline: topology planner, lifecycle controller, and runners.
//!
//! A pipeline is committed by [`Pipeline::create`] (fresh run, prior
//! artifacts cleared) or [`Pipeline::resume`] (manifest authoritative,
//! durable progress injected), then driven by [`Pipeline::run`] in
//! sequential or streaming mode.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Map;

use flowgen_bus::{BusStream, Scheme, StreamRegistry};
use flowgen_core::{
    CancelToken, CompositeHooks, DataStream, ErrorKind, LogHooks, Node, NodeContext, NodeError,
    NodeOverrides, NodeSnapshot, Operator, PipelineHooks, Status, StreamError, StreamState,
    UsageStats, WriterConfig,
};
use flowgen_storage::{
    CheckpointSnapshot, CheckpointStore, ManifestStore, NodeManifest, RuntimeManifest, StoreError,
};

use crate::error::PipelineError;
use crate::ledger::{write_report, ProgressLedger};
use crate::plan::{check_recoverable, plan_chain, NodePlan, PlanDefaults};

/// Pipeline-wide configuration.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Run all nodes concurrently instead of one after another.
    pub streaming: bool,

    /// Keep intermediates durable so the pipeline can resume. When off,
    /// streaming mode replaces welded intermediates with bounded
    /// in-memory bridges.
    pub recoverable: bool,

    /// Default records per batch.
    pub batch_size: usize,

    /// Default worker pool size per node.
    pub parallel_size: usize,

    /// Scheme for auto-generated intermediate URIs.
    pub default_scheme: Scheme,

    /// Base directory for auto-generated intermediates.
    pub intermediate_dir: PathBuf,

    /// Directory holding per-pipeline manifests, checkpoints, and
    /// reports.
    pub results_dir: PathBuf,

    /// Writer strategy applied to every node output.
    pub writer: WriterConfig,

    /// Optional bound on reader waits so a dead producer cannot hang
    /// the pipeline.
    pub read_timeout: Option<Duration>,

    /// Record capacity of each streaming bridge.
    pub bridge_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            streaming: false,
            recoverable: true,
            batch_size: 1,
            parallel_size: 1,
            default_scheme: Scheme::Jsonl,
            intermediate_dir: PathBuf::from("tmp"),
            results_dir: PathBuf::from("tmp/results"),
            writer: WriterConfig::default(),
            read_timeout: None,
            bridge_capacity: 1024,
        }
    }
}

/// A linear chain of operator nodes over durable streams.
pub struct Pipeline {
    operators: Vec<Operator>,
    input_uri: String,
    output_uri: String,
    options: PipelineOptions,
    hooks: Vec<Arc<dyn PipelineHooks>>,
    registry: StreamRegistry,
    pipeline_id: Option<String>,
    plans: Vec<NodePlan>,
    nodes: Vec<Node>,
    status: Status,
    cancel: CancelToken,
    resume_snapshot: CheckpointSnapshot,
}

impl Pipeline {
    /// Creates a pipeline over the given operators and boundary URIs,
    /// with default options and logging hooks.
    #[must_use]
    pub fn new(
        operators: Vec<Operator>,
        input_uri: impl Into<String>,
        output_uri: impl Into<String>,
    ) -> Self {
        Self {
            operators,
            input_uri: input_uri.into(),
            output_uri: output_uri.into(),
            options: PipelineOptions::default(),
            hooks: vec![Arc::new(LogHooks)],
            registry: StreamRegistry::new(),
            pipeline_id: None,
            plans: Vec::new(),
            nodes: Vec::new(),
            status: Status::Pending,
            cancel: CancelToken::new(),
            resume_snapshot: CheckpointSnapshot::default(),
        }
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers an additional hooks observer.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn PipelineHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    /// The cancellation token shared with every node. Trip it once for
    /// a graceful cancel, twice to force termination.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Current pipeline status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    /// The committed pipeline id, if `create` or `resume` has run.
    #[must_use]
    pub fn pipeline_id(&self) -> Option<&str> {
        self.pipeline_id.as_deref()
    }

    /// Point-in-time views of all nodes.
    #[must_use]
    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.iter().map(Node::snapshot).collect()
    }

    fn results_dir_for(&self, pipeline_id: &str) -> PathBuf {
        self.options.results_dir.join(pipeline_id)
    }

    /// Plans the topology, clears prior artifacts for this pipeline id,
    /// materializes nodes, and persists the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] on misconfiguration (including
    /// a memory-backed intermediate on a recoverable pipeline), or a
    /// store/stream error while clearing and persisting.
    pub fn create(
        &mut self,
        pipeline_id: &str,
        overrides: &[NodeOverrides],
    ) -> Result<(), PipelineError> {
        let defaults = PlanDefaults {
            batch_size: self.options.batch_size,
            parallel_size: self.options.parallel_size,
            default_scheme: self.options.default_scheme,
            intermediate_dir: &self.options.intermediate_dir,
        };
        let plans = plan_chain(
            pipeline_id,
            self.operators.len(),
            &self.input_uri,
            &self.output_uri,
            &defaults,
            overrides,
        )?;
        if self.options.recoverable {
            check_recoverable(&plans)?;
        }

        let dir = self.results_dir_for(pipeline_id);
        std::fs::create_dir_all(&dir).map_err(StoreError::Io)?;
        CheckpointStore::new(&dir).clear()?;
        ManifestStore::new(&dir).clear()?;
        let report = dir.join("report.json");
        if report.exists() {
            std::fs::remove_file(report).map_err(StoreError::Io)?;
        }

        // Stale payloads from a previous run of this id are deleted:
        // the auto-generated intermediate directory and every planned
        // output. The input boundary is never an output and is left
        // alone.
        let stale = self.options.intermediate_dir.join(pipeline_id);
        if stale.exists() {
            std::fs::remove_dir_all(&stale).map_err(StoreError::Io)?;
        }
        for plan in &plans {
            self.registry.get_or_create(&plan.output_uri)?.clear()?;
        }

        self.materialize(&plans)?;
        self.plans = plans;
        self.pipeline_id = Some(pipeline_id.to_string());
        self.resume_snapshot = CheckpointSnapshot::new(pipeline_id);
        self.status = Status::Pending;
        self.save_manifest()?;
        tracing::info!("pipeline {pipeline_id} created with {} nodes", self.nodes.len());
        Ok(())
    }

    /// Reconstructs the pipeline from its manifest and durable
    /// checkpoint. Manifest paths are authoritative: URIs configured in
    /// code are ignored once a manifest exists for this id.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ManifestMissing`] when the pipeline was
    /// never created, or [`PipelineError::OperatorCountMismatch`] when
    /// the code-level operator list no longer matches the manifest.
    pub fn resume(&mut self, pipeline_id: &str) -> Result<(), PipelineError> {
        let dir = self.results_dir_for(pipeline_id);
        let manifest = ManifestStore::new(&dir)
            .load()?
            .ok_or_else(|| PipelineError::ManifestMissing(pipeline_id.to_string()))?;
        if manifest.nodes.len() != self.operators.len() {
            return Err(PipelineError::OperatorCountMismatch {
                manifest: manifest.nodes.len(),
                code: self.operators.len(),
            });
        }
        self.options.streaming = manifest.streaming;

        let boundary_output = manifest
            .nodes
            .last()
            .map(|n| n.output_uri.clone())
            .unwrap_or_default();
        let plans: Vec<NodePlan> = manifest
            .nodes
            .iter()
            .map(|n| NodePlan {
                node_id: n.node_id.clone(),
                input_uri: n.input_uri.clone(),
                output_uri: n.output_uri.clone(),
                batch_size: n.batch_size,
                parallel_size: n.parallel_size,
                intermediate_output: n.output_uri != boundary_output,
                extra: n.extra.clone(),
            })
            .collect();

        let snapshot = CheckpointStore::new(&dir)
            .load()?
            .unwrap_or_else(|| CheckpointSnapshot::new(pipeline_id));

        self.materialize(&plans)?;
        for (node, entry) in self.nodes.iter_mut().zip(&manifest.nodes) {
            let (progress, status) = snapshot
                .nodes
                .get(&entry.node_id)
                .map_or((entry.progress, entry.status), |cp| (cp.progress, cp.status));
            node.restore(progress, status);
        }

        // A completed node's seal must be physically present so its
        // downstream drains instead of waiting; everything else is
        // unsealed by its node at open.
        for (plan, node) in plans.iter().zip(&self.nodes) {
            if node.status() == Status::Completed {
                let out = self.registry.get_or_create(&plan.output_uri)?;
                if out.state() != StreamState::Sealed {
                    out.seal()?;
                }
            }
        }

        self.plans = plans;
        self.pipeline_id = Some(pipeline_id.to_string());
        self.resume_snapshot = snapshot;
        self.status = Status::Resuming;
        tracing::info!("pipeline {pipeline_id} resumed from manifest");
        Ok(())
    }

    /// Runs the pipeline to completion, cancellation, or first failure.
    /// The manifest, checkpoint, and report are updated on every exit
    /// path, and hooks see the end event before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Canceled`] if the cancel token tripped,
    /// or the first node failure.
    pub fn run(&mut self) -> Result<(), PipelineError> {
        let pipeline_id = self.pipeline_id.clone().ok_or(PipelineError::NotCreated)?;
        let dir = self.results_dir_for(&pipeline_id);
        let hooks = Arc::new(CompositeHooks::new(self.hooks.clone()));
        let ledger = Arc::new(ProgressLedger::new(
            &pipeline_id,
            CheckpointStore::new(&dir),
            Arc::clone(&hooks),
            std::mem::take(&mut self.resume_snapshot),
        ));

        self.bind_streams()?;

        hooks.on_pipeline_start(&pipeline_id);
        self.status = Status::Running;
        let started = Instant::now();

        let result = if self.options.streaming {
            self.run_streaming(&pipeline_id, &hooks, &ledger)
        } else {
            self.run_sequential(&pipeline_id, &hooks, &ledger)
        };

        self.status = match &result {
            Ok(()) => Status::Completed,
            Err(PipelineError::Canceled) => Status::Canceled,
            Err(_) => Status::Failed,
        };
        if let Err(e) = self.save_manifest() {
            tracing::error!("manifest update failed: {e}");
        }
        let duration = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = write_report(&dir, self.status, duration, &ledger.snapshot()) {
            tracing::error!("report write failed: {e}");
        }
        hooks.on_pipeline_end(&pipeline_id, result.is_ok());
        result
    }

    /// Builds nodes from plans; streams are bound later by
    /// `bind_streams` so streaming mode can substitute bridges.
    fn materialize(&mut self, plans: &[NodePlan]) -> Result<(), PipelineError> {
        self.nodes.clear();
        for (i, plan) in plans.iter().enumerate() {
            let mut node = Node::new(
                &plan.node_id,
                self.operators[i].clone(),
                plan.batch_size,
                plan.parallel_size,
            );
            node.set_writer_config(self.options.writer.clone());
            node.set_read_timeout(self.options.read_timeout);
            if i == 0 {
                // The input boundary is a complete, externally supplied
                // stream; its reader must not wait for a producer.
                node.set_static_input(true);
            }
            self.nodes.push(node);
        }
        Ok(())
    }

    /// Binds every node's input and output. Welded edges share one
    /// stream object; in non-recoverable streaming mode those edges
    /// become bounded in-memory bridges instead of their file streams.
    fn bind_streams(&mut self) -> Result<(), PipelineError> {
        let n = self.plans.len();
        let use_bridges = self.options.streaming && !self.options.recoverable;

        let mut edges: Vec<Arc<dyn DataStream>> = Vec::with_capacity(n.saturating_sub(1));
        for i in 0..n.saturating_sub(1) {
            let plan = &self.plans[i];
            let stream: Arc<dyn DataStream> = if use_bridges && plan.intermediate_output {
                Arc::new(BusStream::bridge(
                    plan.output_uri.clone(),
                    self.options.bridge_capacity,
                ))
            } else {
                self.registry.get_or_create(&plan.output_uri)?
            };
            edges.push(stream);
        }

        for i in 0..n {
            let input = if i == 0 {
                self.registry.get_or_create(&self.plans[0].input_uri)?
            } else {
                Arc::clone(&edges[i - 1])
            };
            let output = if i == n - 1 {
                self.registry.get_or_create(&self.plans[n - 1].output_uri)?
            } else {
                Arc::clone(&edges[i])
            };
            self.nodes[i].bind_io(input, output);
        }
        Ok(())
    }

    fn make_context(
        &self,
        pipeline_id: &str,
        node_id: &str,
        extra: Map<String, serde_json::Value>,
        ledger: &Arc<ProgressLedger>,
    ) -> Arc<NodeContext> {
        let checkpoint_ledger = Arc::clone(ledger);
        let progress_ledger = Arc::clone(ledger);
        let usage_ledger = Arc::clone(ledger);
        Arc::new(NodeContext::new(
            node_id,
            pipeline_id,
            self.cancel.clone(),
            Arc::new(move |nid, progress| checkpoint_ledger.checkpoint(nid, progress)),
            Arc::new(move |nid, current, total| progress_ledger.progress(nid, current, total)),
            Arc::new(move |nid, stats| usage_ledger.usage(nid, stats)),
            extra,
        ))
    }

    fn run_sequential(
        &mut self,
        pipeline_id: &str,
        hooks: &Arc<CompositeHooks>,
        ledger: &Arc<ProgressLedger>,
    ) -> Result<(), PipelineError> {
        for i in 0..self.nodes.len() {
            if self.cancel.is_cancelled() {
                self.cancel_from(i, ledger);
                return Err(PipelineError::Canceled);
            }
            if self.nodes[i].status() == Status::Completed {
                tracing::info!(
                    "[{pipeline_id}:{}] already completed, skipping",
                    self.nodes[i].node_id()
                );
                continue;
            }

            let node_id = self.nodes[i].node_id().to_string();
            let extra = self.plans[i].extra.clone();
            hooks.on_node_start(pipeline_id, &node_id);
            let ctx = self.make_context(pipeline_id, &node_id, extra, ledger);

            let node = &mut self.nodes[i];
            let run_result = match node.open(Arc::clone(&ctx)) {
                Ok(()) => node.run(),
                Err(e) => {
                    let _ = node.close();
                    Err(e)
                }
            };
            ledger.terminal(&node_id, node.progress(), node.status(), &ctx.usage_totals());

            if let Err(e) = run_result {
                if !matches!(e, NodeError::Canceled) {
                    hooks.on_error(pipeline_id, &node_id, error_kind(&e), &e.to_string());
                }
                self.cancel_from(i + 1, ledger);
                return Err(match e {
                    NodeError::Canceled => PipelineError::Canceled,
                    other => PipelineError::node(node_id, other),
                });
            }
        }
        Ok(())
    }

    fn run_streaming(
        &mut self,
        pipeline_id: &str,
        hooks: &Arc<CompositeHooks>,
        ledger: &Arc<ProgressLedger>,
    ) -> Result<(), PipelineError> {
        let n = self.nodes.len();

        // Open every non-completed node first, in chain order, so each
        // upstream unseal lands before any downstream end-of-stream
        // check can observe a stale marker.
        let mut ctxs: Vec<Option<Arc<NodeContext>>> = Vec::with_capacity(n);
        for i in 0..n {
            if self.nodes[i].status() == Status::Completed {
                tracing::info!(
                    "[{pipeline_id}:{}] already completed, skipping",
                    self.nodes[i].node_id()
                );
                ctxs.push(None);
                continue;
            }
            let node_id = self.nodes[i].node_id().to_string();
            let ctx = self.make_context(pipeline_id, &node_id, self.plans[i].extra.clone(), ledger);
            if let Err(e) = self.nodes[i].open(Arc::clone(&ctx)) {
                let _ = self.nodes[i].close();
                hooks.on_error(pipeline_id, &node_id, error_kind(&e), &e.to_string());
                self.cancel_from(0, ledger);
                return Err(PipelineError::node(node_id, e));
            }
            hooks.on_node_start(pipeline_id, &node_id);
            ctxs.push(Some(ctx));
        }

        let nodes = std::mem::take(&mut self.nodes);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let mut collected: Vec<(usize, Node)> = Vec::with_capacity(n);
        let mut handles = Vec::new();

        for (i, mut node) in nodes.into_iter().enumerate() {
            match ctxs[i].take() {
                None => collected.push((i, node)),
                Some(ctx) => {
                    let tx = done_tx.clone();
                    handles.push(std::thread::spawn(move || {
                        let result = node.run();
                        let usage = ctx.usage_totals();
                        let _ = tx.send((i, node, result, usage));
                    }));
                }
            }
        }
        drop(done_tx);

        let mut first_err: Option<(String, NodeError)> = None;
        for (i, node, result, usage) in done_rx.iter() {
            ledger.terminal(node.node_id(), node.progress(), node.status(), &usage);
            if let Err(e) = result {
                if !matches!(e, NodeError::Canceled) {
                    hooks.on_error(pipeline_id, node.node_id(), error_kind(&e), &e.to_string());
                    if first_err.is_none() {
                        first_err = Some((node.node_id().to_string(), e));
                    }
                }
                // One failing node cancels the rest; they drain their
                // in-flight batches and exit.
                if !self.cancel.is_cancelled() {
                    self.cancel.trip();
                }
            }
            collected.push((i, node));
        }
        for handle in handles {
            let _ = handle.join();
        }

        collected.sort_by_key(|(i, _)| *i);
        self.nodes = collected.into_iter().map(|(_, node)| node).collect();

        match first_err {
            Some((node_id, e)) => Err(PipelineError::node(node_id, e)),
            None if self.cancel.is_cancelled() => Err(PipelineError::Canceled),
            None => Ok(()),
        }
    }

    /// Cancels nodes from `start` on and records their state.
    fn cancel_from(&mut self, start: usize, ledger: &Arc<ProgressLedger>) {
        let start = start.min(self.nodes.len());
        for node in &mut self.nodes[start..] {
            if node.status() == Status::Completed {
                continue;
            }
            node.cancel();
            ledger.terminal(
                node.node_id(),
                node.progress(),
                node.status(),
                &UsageStats::new(),
            );
        }
    }

    fn save_manifest(&self) -> Result<(), PipelineError> {
        let Some(pipeline_id) = self.pipeline_id.as_deref() else {
            return Err(PipelineError::NotCreated);
        };
        let mut manifest = RuntimeManifest::new(pipeline_id, self.options.streaming);
        manifest.status = self.status;
        for (plan, node) in self.plans.iter().zip(&self.nodes) {
            manifest.nodes.push(NodeManifest {
                node_id: plan.node_id.clone(),
                input_uri: plan.input_uri.clone(),
                output_uri: plan.output_uri.clone(),
                batch_size: plan.batch_size,
                parallel_size: plan.parallel_size,
                progress: node.progress(),
                status: node.status(),
                extra: plan.extra.clone(),
            });
        }
        ManifestStore::new(self.results_dir_for(pipeline_id)).save(&manifest)?;
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("pipeline_id", &self.pipeline_id)
            .field("status", &self.status)
            .field("nodes", &self.nodes.len())
            .field("streaming", &self.options.streaming)
            .finish_non_exhaustive()
    }
}

/// Classifies a node error for hook delivery.
fn error_kind(e: &NodeError) -> ErrorKind {
    match e {
        NodeError::Operator { .. } | NodeError::Cardinality { .. } => ErrorKind::Operator,
        NodeError::Stream(StreamError::CheckpointMismatch { .. }) => ErrorKind::Checkpoint,
        NodeError::Stream(StreamError::ProtocolUnknown(_)) => ErrorKind::Config,
        NodeError::Stream(_) => ErrorKind::Io,
        NodeError::Canceled | NodeError::NotOpen | NodeError::WorkerPanic => ErrorKind::Fatal,
    }
}
