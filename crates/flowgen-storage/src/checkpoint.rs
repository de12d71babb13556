//! Durable per-node progress: `checkpoint.json`.
//!
//! The checkpoint maps each node id to the count of input records it has
//! consumed. It is the single authoritative source for "what has been
//! produced" on resume; code and configuration are advisory. Updates use
//! atomic replace so a crash mid-write leaves the previous good version
//! in place.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use flowgen_core::Status;

use crate::atomic::write_atomic;
use crate::StoreError;

/// Durable state of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCheckpoint {
    /// Input records consumed; the reader's resume offset.
    pub progress: u64,

    /// Status at the last persist.
    pub status: Status,

    /// Accumulated usage counters, carried so resumed runs keep their
    /// token and cost totals.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub usage: BTreeMap<String, f64>,
}

impl NodeCheckpoint {
    /// Creates a checkpoint entry.
    #[must_use]
    pub fn new(progress: u64, status: Status) -> Self {
        Self {
            progress,
            status,
            usage: BTreeMap::new(),
        }
    }
}

/// The whole checkpoint document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    /// The owning pipeline.
    pub pipeline_id: String,

    /// Seconds since the epoch at the last persist.
    #[serde(default)]
    pub updated_at: u64,

    /// Per-node durable state.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeCheckpoint>,
}

impl CheckpointSnapshot {
    /// Creates an empty snapshot for a pipeline.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            updated_at: 0,
            nodes: BTreeMap::new(),
        }
    }

    /// The durable progress recorded for a node, if any.
    #[must_use]
    pub fn progress_of(&self, node_id: &str) -> Option<u64> {
        self.nodes.get(node_id).map(|n| n.progress)
    }
}

/// Filesystem-backed checkpoint persistence for one pipeline.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Creates a store rooted at the pipeline's results directory
    /// (`{results_dir}/{pipeline_id}`).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The checkpoint file path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join("checkpoint.json")
    }

    /// Persists the snapshot atomically, stamping `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on I/O or serialization failure.
    pub fn save(&self, snapshot: &CheckpointSnapshot) -> Result<(), StoreError> {
        let mut stamped = snapshot.clone();
        stamped.updated_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let json = serde_json::to_string_pretty(&stamped)?;
        write_atomic(&self.path(), &json)
    }

    /// Loads the snapshot, or `None` if no checkpoint exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on I/O or deserialization failure.
    pub fn load(&self) -> Result<Option<CheckpointSnapshot>, StoreError> {
        load_json(&self.path())
    }

    /// Removes the checkpoint file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on filesystem failure.
    pub fn clear(&self) -> Result<(), StoreError> {
        let path = self.path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

pub(crate) fn load_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&json)?))
}
