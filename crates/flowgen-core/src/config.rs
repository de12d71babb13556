//! Scheduling and writer configuration types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Write strategy for a stream writer.
///
/// With `async_mode` off, every `write_batch` is a synchronous physical
/// append. With it on, writes enqueue onto a bounded channel drained by a
/// single background worker; the full channel blocking producers is the
/// sole mechanism bounding memory end to end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Enables the asynchronous batch writer.
    pub async_mode: bool,

    /// Capacity of the bounded write queue, in records.
    pub queue_size: usize,

    /// The worker flushes once this many records have accumulated.
    pub flush_batch_size: usize,

    /// The worker flushes once this long has passed since the last
    /// flush, even if `flush_batch_size` was not reached (ms).
    pub flush_interval_ms: u64,

    /// Poll interval for empty-queue waits and annealing retries (ms).
    pub retry_interval_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            async_mode: false,
            queue_size: 5000,
            flush_batch_size: 100,
            flush_interval_ms: 1000,
            retry_interval_ms: 100,
        }
    }
}

impl WriterConfig {
    /// Returns a config with the asynchronous writer enabled.
    #[must_use]
    pub fn asynchronous() -> Self {
        Self {
            async_mode: true,
            ..Self::default()
        }
    }
}

/// Per-node overrides applied when a pipeline is created.
///
/// Any field left `None` inherits the pipeline-level default. `extra` is
/// stored in the manifest and handed to the operator verbatim; the runtime
/// never interprets it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOverrides {
    /// Records per batch for this node.
    pub batch_size: Option<usize>,

    /// Worker pool size for this node (1 selects the sequential engine).
    pub parallel_size: Option<usize>,

    /// Explicit input URI. Wins over welding and auto-generation.
    pub input_uri: Option<String>,

    /// Explicit output URI. Wins over welding and auto-generation.
    pub output_uri: Option<String>,

    /// Opaque operator-specific parameters.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl NodeOverrides {
    /// Creates an empty override set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the batch size.
    #[must_use]
    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = Some(n);
        self
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn parallel_size(mut self, n: usize) -> Self {
        self.parallel_size = Some(n);
        self
    }

    /// Sets an explicit input URI.
    #[must_use]
    pub fn input_uri(mut self, uri: impl Into<String>) -> Self {
        self.input_uri = Some(uri.into());
        self
    }

    /// Sets an explicit output URI.
    #[must_use]
    pub fn output_uri(mut self, uri: impl Into<String>) -> Self {
        self.output_uri = Some(uri.into());
        self
    }

    /// Adds an operator-specific parameter.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}
