//! The runtime manifest: `runtime.json`.
//!
//! A manifest is the durable snapshot of a pipeline's planned topology:
//! node order, stream URIs, and scheduling parameters. Once a manifest
//! exists for a pipeline id, its path fields are authoritative on
//! resume; conflicting URIs passed in code are ignored.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use flowgen_core::Status;

use crate::atomic::write_atomic;
use crate::checkpoint::load_json;
use crate::StoreError;

/// One node's entry in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeManifest {
    /// The node's id.
    pub node_id: String,

    /// Input stream URI.
    pub input_uri: String,

    /// Output stream URI.
    pub output_uri: String,

    /// Records per batch.
    pub batch_size: usize,

    /// Worker pool size.
    pub parallel_size: usize,

    /// Progress at the last manifest write. The checkpoint file holds
    /// the live value; this one is a snapshot for inspection.
    pub progress: u64,

    /// Status at the last manifest write.
    pub status: Status,

    /// Opaque operator parameters, passed through verbatim.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// The durable topology snapshot of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeManifest {
    /// The pipeline id.
    pub pipeline_id: String,

    /// Pipeline status at the last write.
    pub status: Status,

    /// Whether the pipeline runs its nodes concurrently.
    pub streaming: bool,

    /// Nodes in execution order. On resume they are reconstructed in
    /// this order with these exact parameters.
    pub nodes: Vec<NodeManifest>,
}

impl RuntimeManifest {
    /// Creates a manifest with no nodes.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, streaming: bool) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            status: Status::Pending,
            streaming,
            nodes: Vec::new(),
        }
    }

    /// Looks up a node entry by id.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&NodeManifest> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

/// Filesystem-backed manifest persistence for one pipeline.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    /// Creates a store rooted at the pipeline's results directory
    /// (`{results_dir}/{pipeline_id}`).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The manifest file path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join("runtime.json")
    }

    /// Persists the manifest atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on I/O or serialization failure.
    pub fn save(&self, manifest: &RuntimeManifest) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(manifest)?;
        write_atomic(&self.path(), &json)?;
        tracing::debug!("manifest saved: {}", self.path().display());
        Ok(())
    }

    /// Loads the manifest, or `None` if this pipeline was never
    /// created.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on I/O or deserialization failure.
    pub fn load(&self) -> Result<Option<RuntimeManifest>, StoreError> {
        load_json(&self.path())
    }

    /// Removes the manifest file.
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
