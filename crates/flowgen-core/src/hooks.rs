//! Observer hooks for pipeline and node lifecycle events.

use std::sync::Arc;

use crate::context::UsageStats;
use crate::status::Status;

/// Classification of an error event delivered to hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration detected before running.
    Config,
    /// Checkpoint or manifest disagreement.
    Checkpoint,
    /// Stream or filesystem failure.
    Io,
    /// Failure raised by user operator code.
    Operator,
    /// Unrecoverable failure (corrupt payload, disk full).
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Config => "config",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::Io => "io",
            ErrorKind::Operator => "operator",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Callbacks observed over a pipeline run. All methods default to no-ops;
/// implementations override what they care about.
///
/// Hooks are invoked from node threads and must be thread-safe. Every
/// error event reaches `on_error` before the pipeline returns.
pub trait PipelineHooks: Send + Sync {
    /// The pipeline began running.
    fn on_pipeline_start(&self, _pipeline_id: &str) {}

    /// The pipeline finished, successfully or not.
    fn on_pipeline_end(&self, _pipeline_id: &str, _success: bool) {}

    /// A node began running.
    fn on_node_start(&self, _pipeline_id: &str, _node_id: &str) {}

    /// A node reached a terminal status.
    fn on_node_end(&self, _pipeline_id: &str, _node_id: &str, _status: Status) {}

    /// A node's observable progress advanced.
    fn on_progress(&self, _pipeline_id: &str, _node_id: &str, _current: u64, _total: Option<u64>) {}

    /// An operator reported usage counters.
    fn on_usage(&self, _pipeline_id: &str, _node_id: &str, _stats: &UsageStats) {}

    /// A node's durable progress was persisted.
    fn on_checkpoint(&self, _pipeline_id: &str, _node_id: &str, _progress: u64) {}

    /// An error occurred. `node_id` is empty for pipeline-level errors.
    fn on_error(&self, _pipeline_id: &str, _node_id: &str, _kind: ErrorKind, _detail: &str) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl PipelineHooks for NoopHooks {}

/// Fans every event out to a list of hooks, in order.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Arc<dyn PipelineHooks>>,
}

impl CompositeHooks {
    /// Creates a composite over the given hooks.
    #[must_use]
    pub fn new(hooks: Vec<Arc<dyn PipelineHooks>>) -> Self {
        Self { hooks }
    }

    /// Appends another observer.
    pub fn push(&mut self, hooks: Arc<dyn PipelineHooks>) {
        self.hooks.push(hooks);
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns `true` when no observers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl PipelineHooks for CompositeHooks {
    fn on_pipeline_start(&self, pipeline_id: &str) {
        for h in &self.hooks {
            h.on_pipeline_start(pipeline_id);
        }
    }

    fn on_pipeline_end(&self, pipeline_id: &str, success: bool) {
        for h in &self.hooks {
            h.on_pipeline_end(pipeline_id, success);
        }
    }

    fn on_node_start(&self, pipeline_id: &str, node_id: &str) {
        for h in &self.hooks {
            h.on_node_start(pipeline_id, node_id);
        }
    }

    fn on_node_end(&self, pipeline_id: &str, node_id: &str, status: Status) {
        for h in &self.hooks {
            h.on_node_end(pipeline_id, node_id, status);
        }
    }

    fn on_progress(&self, pipeline_id: &str, node_id: &str, current: u64, total: Option<u64>) {
        for h in &self.hooks {
            h.on_progress(pipeline_id, node_id, current, total);
        }
    }

    fn on_usage(&self, pipeline_id: &str, node_id: &str, stats: &UsageStats) {
        for h in &self.hooks {
            h.on_usage(pipeline_id, node_id, stats);
        }
    }

    fn on_checkpoint(&self, pipeline_id: &str, node_id: &str, progress: u64) {
        for h in &self.hooks {
            h.on_checkpoint(pipeline_id, node_id, progress);
        }
    }

    fn on_error(&self, pipeline_id: &str, node_id: &str, kind: ErrorKind, detail: &str) {
        for h in &self.hooks {
            h.on_error(pipeline_id, node_id, kind, detail);
        }
    }
}

impl std::fmt::Debug for CompositeHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeHooks")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Hooks that emit `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHooks;

impl PipelineHooks for LogHooks {
    fn on_pipeline_start(&self, pipeline_id: &str) {
        tracing::info!("pipeline {pipeline_id} started");
    }

    fn on_pipeline_end(&self, pipeline_id: &str, success: bool) {
        if success {
            tracing::info!("pipeline {pipeline_id} completed");
        } else {
            tracing::warn!("pipeline {pipeline_id} failed");
        }
    }

    fn on_node_start(&self, pipeline_id: &str, node_id: &str) {
        tracing::info!("[{pipeline_id}:{node_id}] node started");
    }

    fn on_node_end(&self, pipeline_id: &str, node_id: &str, status: Status) {
        tracing::info!("[{pipeline_id}:{node_id}] node ended: {status}");
    }

    fn on_progress(&self, pipeline_id: &str, node_id: &str, current: u64, total: Option<u64>) {
        match total {
            Some(total) => tracing::debug!("[{pipeline_id}:{node_id}] progress {current}/{total}"),
            None => tracing::debug!("[{pipeline_id}:{node_id}] progress {current}"),
        }
    }

    fn on_checkpoint(&self, pipeline_id: &str, node_id: &str, progress: u64) {
        tracing::debug!("[{pipeline_id}:{node_id}] checkpoint at {progress}");
    }

    fn on_error(&self, pipeline_id: &str, node_id: &str, kind: ErrorKind, detail: &str) {
        tracing::error!("[{pipeline_id}:{node_id}] {kind} error: {detail}");
    }
}
