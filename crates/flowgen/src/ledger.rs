//! The progress ledger: the pipeline-side sink for node callbacks.
//!
//! Nodes never hold a reference to the pipeline; their contexts carry
//! closures into this ledger instead. The ledger merges per-node
//! progress and usage, persists the checkpoint document on every
//! durable update, and forwards everything to the hooks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use flowgen_core::{CompositeHooks, PipelineHooks, Status, UsageStats};
use flowgen_storage::{CheckpointSnapshot, CheckpointStore, NodeCheckpoint, StoreError};

/// Thread-safe progress and usage accounting for one pipeline run.
pub struct ProgressLedger {
    pipeline_id: String,
    store: CheckpointStore,
    hooks: Arc<CompositeHooks>,
    state: Mutex<CheckpointSnapshot>,
}

impl ProgressLedger {
    /// Creates a ledger seeded with any prior checkpoint state (so a
    /// resumed run keeps historical usage totals).
    #[must_use]
    pub fn new(
        pipeline_id: impl Into<String>,
        store: CheckpointStore,
        hooks: Arc<CompositeHooks>,
        initial: CheckpointSnapshot,
    ) -> Self {
        let pipeline_id = pipeline_id.into();
        let mut state = initial;
        state.pipeline_id.clone_from(&pipeline_id);
        Self {
            pipeline_id,
            store,
            hooks,
            state: Mutex::new(state),
        }
    }

    /// Records a durable progress update for a node and persists the
    /// checkpoint document. This is the at-most-once anchor: called at
    /// read/dispatch time, before results exist.
    pub fn checkpoint(&self, node_id: &str, progress: u64) {
        {
            let mut state = self.state.lock();
            let entry = state
                .nodes
                .entry(node_id.to_string())
                .or_insert_with(|| NodeCheckpoint::new(0, Status::Running));
            entry.progress = entry.progress.max(progress);
            if !entry.status.is_terminal() {
                entry.status = Status::Running;
            }
            if let Err(e) = self.store.save(&state) {
                tracing::error!("checkpoint persist failed for {node_id}: {e}");
            }
        }
        self.hooks.on_checkpoint(&self.pipeline_id, node_id, progress);
    }

    /// Records a node's terminal state and persists it.
    pub fn terminal(&self, node_id: &str, progress: u64, status: Status, usage: &UsageStats) {
        {
            let mut state = self.state.lock();
            let entry = state
                .nodes
                .entry(node_id.to_string())
                .or_insert_with(|| NodeCheckpoint::new(0, status));
            entry.progress = entry.progress.max(progress);
            entry.status = status;
            merge_usage(&mut entry.usage, usage);
            if let Err(e) = self.store.save(&state) {
                tracing::error!("checkpoint persist failed for {node_id}: {e}");
            }
        }
        self.hooks.on_node_end(&self.pipeline_id, node_id, status);
    }

    /// Forwards an observable progress update to the hooks.
    pub fn progress(&self, node_id: &str, current: u64, total: Option<u64>) {
        self.hooks
            .on_progress(&self.pipeline_id, node_id, current, total);
    }

    /// Merges reported usage counters and forwards them to the hooks.
    /// Counters ride along with the next checkpoint persist.
    pub fn usage(&self, node_id: &str, stats: &UsageStats) {
        {
            let mut state = self.state.lock();
            let entry = state
                .nodes
                .entry(node_id.to_string())
                .or_insert_with(|| NodeCheckpoint::new(0, Status::Running));
            merge_usage(&mut entry.usage, stats);
        }
        self.hooks.on_usage(&self.pipeline_id, node_id, stats);
    }

    /// A copy of the current checkpoint state.
    #[must_use]
    pub fn snapshot(&self) -> CheckpointSnapshot {
        self.state.lock().clone()
    }
}

fn merge_usage(into: &mut BTreeMap<String, f64>, stats: &UsageStats) {
    for (key, value) in stats.iter() {
        *into.entry(key.clone()).or_insert(0.0) += value;
    }
}

impl std::fmt::Debug for ProgressLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressLedger")
            .field("pipeline_id", &self.pipeline_id)
            .finish_non_exhaustive()
    }
}

/// Writes the end-of-run report (`report.json`): per-node progress,
/// status, and usage totals.
///
/// # Errors
///
/// Returns [`StoreError`] on I/O or serialization failure.
pub fn write_report(
    dir: &Path,
    status: Status,
    duration_ms: u64,
    snapshot: &CheckpointSnapshot,
) -> Result<(), StoreError> {
    let nodes: serde_json::Map<String, serde_json::Value> = snapshot
        .nodes
        .iter()
        .map(|(node_id, cp)| {
            let entry = serde_json::json!({
                "progress": cp.progress,
                "status": cp.status,
                "usage": cp.usage,
            });
            (node_id.clone(), entry)
        })
        .collect();
    let report = serde_json::json!({
        "pipeline_id": snapshot.pipeline_id,
        "status": status,
        "duration_ms": duration_ms,
        "nodes": nodes,
    });
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join("report.json"), serde_json::to_string_pretty(&report)?)?;
    Ok(())
}
