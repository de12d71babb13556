//! Pipeline-level errors.

use flowgen_core::{ConfigError, NodeError, StreamError};
use flowgen_storage::StoreError;
use thiserror::Error;

/// Errors surfaced by pipeline planning and execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Misconfiguration detected before running.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A node failed; the remaining nodes were canceled.
    #[error("node '{node_id}' failed: {source}")]
    Node {
        /// The failing node.
        node_id: String,
        /// The underlying node error.
        source: NodeError,
    },

    /// A stream operation failed outside any node.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Checkpoint or manifest persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// `resume` was called for a pipeline id that has no manifest.
    #[error("no manifest found for pipeline '{0}'")]
    ManifestMissing(String),

    /// `run` was called before `create` or `resume`.
    #[error("pipeline has not been created or resumed")]
    NotCreated,

    /// The operator list passed in code does not match the manifest
    /// being resumed.
    #[error("operator count {code} does not match the manifest ({manifest})")]
    OperatorCountMismatch {
        /// Nodes recorded in the manifest.
        manifest: usize,
        /// Operators supplied in code.
        code: usize,
    },

    /// The run was canceled before completion.
    #[error("pipeline canceled")]
    Canceled,
}

impl PipelineError {
    /// Wraps a node error with its node id.
    #[must_use]
    pub fn node(node_id: impl Into<String>, source: NodeError) -> Self {
        PipelineError::Node {
            node_id: node_id.into(),
            source,
        }
    }
}
