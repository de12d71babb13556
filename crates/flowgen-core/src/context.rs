//! Cancellation, usage accounting, and the per-node execution context.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};

/// How far a cancellation has escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelLevel {
    /// No cancellation requested.
    None,
    /// Cooperative cancel: in-flight batches finish, then nodes close.
    Graceful,
    /// Forced termination: data loss is permitted.
    Forced,
}

/// Caller-owned cancellation token shared by a pipeline and its nodes.
///
/// The first `trip` puts the pipeline into `Canceling`; a second one
/// escalates to forced termination. The token is never registered with a
/// process-global signal handler; an embedding binary wires its own
/// interrupt handling to `trip`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    level: Arc<AtomicU8>,
}

impl CancelToken {
    /// Creates an untripped token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Escalates the cancel level by one step and returns the new level.
    pub fn trip(&self) -> CancelLevel {
        let prev = self
            .level
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_add(1).min(2)))
            .unwrap_or(2);
        match prev {
            0 => CancelLevel::Graceful,
            _ => CancelLevel::Forced,
        }
    }

    /// Returns the current cancel level.
    #[must_use]
    pub fn level(&self) -> CancelLevel {
        match self.level.load(Ordering::SeqCst) {
            0 => CancelLevel::None,
            1 => CancelLevel::Graceful,
            _ => CancelLevel::Forced,
        }
    }

    /// Returns `true` once any cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.level() > CancelLevel::None
    }

    /// Returns `true` once cancellation has escalated to forced.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.level() == CancelLevel::Forced
    }
}

/// Numeric usage counters reported by operators (tokens, cost, calls).
///
/// Counters are merged additively; non-numeric data does not belong here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageStats(FxHashMap<String, f64>);

impl UsageStats {
    /// Creates an empty counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` to the named counter.
    pub fn add(&mut self, key: impl Into<String>, amount: f64) {
        *self.0.entry(key.into()).or_insert(0.0) += amount;
    }

    /// Returns the value of a counter, or 0 if absent.
    #[must_use]
    pub fn get(&self, key: &str) -> f64 {
        self.0.get(key).copied().unwrap_or(0.0)
    }

    /// Merges another counter set into this one.
    pub fn merge(&mut self, other: &UsageStats) {
        for (k, v) in &other.0 {
            *self.0.entry(k.clone()).or_insert(0.0) += v;
        }
    }

    /// Iterates over the counters.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    /// Returns `true` if no counters have been reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Callback persisting a node's durable progress. Arguments: node id,
/// consumed-record count.
pub type CheckpointFn = Arc<dyn Fn(&str, u64) + Send + Sync>;

/// Callback reporting observable progress. Arguments: node id, current,
/// total hint.
pub type ProgressFn = Arc<dyn Fn(&str, u64, Option<u64>) + Send + Sync>;

/// Callback forwarding operator usage counters. Arguments: node id, the
/// counters reported by one call.
pub type UsageFn = Arc<dyn Fn(&str, &UsageStats) + Send + Sync>;

/// Execution context handed to a node at `open` and exposed to its
/// operator.
///
/// The context is the node's only line back to the pipeline: checkpoint
/// persistence, progress reporting, and usage accounting all flow through
/// callbacks installed here, so nodes hold no reference to the pipeline
/// itself.
pub struct NodeContext {
    node_id: String,
    pipeline_id: String,
    cancel: CancelToken,
    checkpoint: CheckpointFn,
    progress: ProgressFn,
    usage: UsageFn,
    totals: Mutex<UsageStats>,
    extra: Map<String, Value>,
}

impl NodeContext {
    /// Creates a context wired to the given callbacks.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        cancel: CancelToken,
        checkpoint: CheckpointFn,
        progress: ProgressFn,
        usage: UsageFn,
        extra: Map<String, Value>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            pipeline_id: pipeline_id.into(),
            cancel,
            checkpoint,
            progress,
            usage,
            totals: Mutex::new(UsageStats::new()),
            extra,
        }
    }

    /// Creates a context with no-op callbacks, for tests and ad-hoc runs.
    #[must_use]
    pub fn detached(node_id: impl Into<String>) -> Self {
        Self::new(
            node_id,
            "detached",
            CancelToken::new(),
            Arc::new(|_, _| {}),
            Arc::new(|_, _, _| {}),
            Arc::new(|_, _| {}),
            Map::new(),
        )
    }

    /// The id of the node this context belongs to.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The id of the owning pipeline.
    #[must_use]
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Returns `true` once the pipeline has been asked to cancel.
    /// Long-running operators poll this to self-terminate.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The shared cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Opaque per-node parameters, passed through verbatim from the
    /// node configuration.
    #[must_use]
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// Reports usage counters for one operator invocation. Counters are
    /// accumulated locally and forwarded to the pipeline's hooks.
    pub fn report_usage(&self, stats: &UsageStats) {
        self.totals.lock().merge(stats);
        (self.usage)(&self.node_id, stats);
    }

    /// Returns the accumulated usage totals for this node.
    #[must_use]
    pub fn usage_totals(&self) -> UsageStats {
        self.totals.lock().clone()
    }

    /// Persists the durable consumed-record count for this node. Called
    /// by the engine at read/dispatch time; this value is what resume
    /// positions the reader to.
    pub fn persist_checkpoint(&self, consumed: u64) {
        (self.checkpoint)(&self.node_id, consumed);
    }

    /// Reports observable progress to the pipeline's hooks.
    pub fn report_progress(&self, current: u64, total: Option<u64>) {
        (self.progress)(&self.node_id, current, total);
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("pipeline_id", &self.pipeline_id)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
