//! Error types for streams, operators, and node execution.

use crate::record::Anchor;

/// Errors that can occur during stream I/O.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The URI scheme is not handled by any registered stream implementation.
    #[error("unknown stream protocol: '{0}'")]
    ProtocolUnknown(String),

    /// A bounded read returned no data within the caller's timeout.
    #[error("read timed out after {waited_ms}ms")]
    TimeoutExceeded {
        /// How long the reader waited before giving up.
        waited_ms: u64,
    },

    /// The record found at a resume offset does not agree with the
    /// durable checkpoint. Running on would re-invoke paid work.
    #[error("checkpoint mismatch at offset {expected}: found anchor {found}")]
    CheckpointMismatch {
        /// The resume offset the reader was positioned to.
        expected: u64,
        /// The anchor actually found at that position.
        found: Anchor,
    },

    /// A write was attempted on a sealed stream.
    #[error("stream is sealed: {0}")]
    Sealed(String),

    /// A second writer was requested while one is still active.
    #[error("stream already has an active writer: {0}")]
    WriterBusy(String),

    /// The payload could not be decoded.
    #[error("malformed payload at record {ordinal}: {detail}")]
    Malformed {
        /// Zero-based ordinal of the offending record.
        ordinal: u64,
        /// Description of the decode failure.
        detail: String,
    },

    /// An I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised by user operator code.
///
/// Operators return this from `process_batch` / `process_item`; the node
/// container wraps it with the node id and the anchor range of the batch
/// that was in flight.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// A failure described by the operator itself.
    #[error("{0}")]
    Message(String),

    /// The operator panicked; the payload is the panic message if it
    /// was a string.
    #[error("operator panicked: {0}")]
    Panicked(String),

    /// An underlying error the operator chose to propagate.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl OperatorError {
    /// Creates an operator error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        OperatorError::Message(message.into())
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for OperatorError {
    fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
        OperatorError::Other(e)
    }
}

/// Errors raised while driving one node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The operator failed while processing the given anchor range.
    #[error("operator failed on anchors {first}..={last}: {source}")]
    Operator {
        /// First anchor of the failed batch.
        first: Anchor,
        /// Last anchor of the failed batch.
        last: Anchor,
        /// The underlying operator error.
        source: OperatorError,
    },

    /// A 1:1 batch operator returned a different number of records
    /// than it was given.
    #[error("operator returned {actual} records for a 1:1 batch of {expected}")]
    Cardinality {
        /// Input batch length.
        expected: usize,
        /// Output length the operator produced.
        actual: usize,
    },

    /// A stream operation failed.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The node was canceled before it drained its input.
    #[error("node canceled")]
    Canceled,

    /// The node was driven without `bind_io` and `open` having run.
    #[error("node is not open")]
    NotOpen,

    /// A worker or writer thread of the parallel engine panicked.
    #[error("worker thread panicked")]
    WorkerPanic,
}

/// Configuration errors detected before a pipeline runs.
///
/// These are never downgraded: a misconfigured pipeline refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A URI names a scheme no stream implementation handles.
    #[error("unknown scheme in URI '{0}'")]
    UnknownScheme(String),

    /// An intermediate stream is memory-backed while the pipeline is
    /// recoverable. Recovery needs durable intermediates.
    #[error("node '{node_id}' has volatile intermediate '{uri}' on a recoverable pipeline")]
    VolatileIntermediate {
        /// The node whose output is volatile.
        node_id: String,
        /// The offending URI.
        uri: String,
    },

    /// Adjacent nodes were configured with conflicting URIs.
    #[error("URI mismatch between '{upstream}' and '{downstream}': {upstream_uri} != {downstream_uri}")]
    UriMismatch {
        /// Upstream node id.
        upstream: String,
        /// Downstream node id.
        downstream: String,
        /// URI the upstream output was set to.
        upstream_uri: String,
        /// URI the downstream input was set to.
        downstream_uri: String,
    },

    /// A scheduling parameter is out of range.
    #[error("invalid value {value} for '{name}' (must be >= 1)")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// The rejected value.
        value: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_display() {
        let err = StreamError::ProtocolUnknown("ftp".into());
        assert_eq!(err.to_string(), "unknown stream protocol: 'ftp'");

        let err = StreamError::CheckpointMismatch {
            expected: 300,
            found: 120,
        };
        assert!(err.to_string().contains("offset 300"));
        assert!(err.to_string().contains("anchor 120"));
    }

    #[test]
    fn test_operator_error_wraps_into_node_error() {
        let err = NodeError::Operator {
            first: 10,
            last: 19,
            source: OperatorError::msg("llm call failed"),
        };
        assert!(err.to_string().contains("10..=19"));
        assert!(err.to_string().contains("llm call failed"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::VolatileIntermediate {
            node_id: "node_1".into(),
            uri: "memory://x".into(),
        };
        assert!(err.to_string().contains("node_1"));
        assert!(err.to_string().contains("memory://x"));
    }
}
