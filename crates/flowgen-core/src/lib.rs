//! # Flowgen Core
//!
//! Data model, operator contract, and node execution engines for Flowgen
//! data-generation pipelines.
//!
//! This crate defines the contracts the rest of the workspace builds on:
//!
//! - [`record`] - records, envelopes, and the anchor (`_i`) convention
//! - [`operator`] - the operator sum type and the uniform batch adapter
//! - [`stream`] - the stream bus traits (`DataStream`, reader, writer)
//! - [`node`] - the execution container with sequential and parallel
//!   engines
//! - [`context`] - cancellation, usage accounting, node context
//! - [`hooks`] - lifecycle observer callbacks
//! - [`error`] - the error taxonomy
//!
//! Concrete stream implementations live in `flowgen-bus`; durable
//! checkpoints and manifests in `flowgen-storage`; the pipeline planner
//! and runners in `flowgen`.
//!
//! The runtime is thread-based: operator invocations are expected to
//! block, and all coordination happens over channels and condition
//! variables rather than an async executor.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(
    test,
    allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::unreadable_literal
    )
)]

/// Scheduling and writer configuration types.
pub mod config;

/// Cancellation, usage accounting, and the per-node execution context.
pub mod context;

/// Error types for streams, operators, and node execution.
pub mod error;

/// Observer hooks for pipeline and node lifecycle events.
pub mod hooks;

/// The node execution container and its batch engines.
pub mod node;

/// The operator contract and the uniform batch adapter.
pub mod operator;

/// The record data model: business records, envelopes, and anchors.
pub mod record;

/// Lifecycle status shared by nodes and pipelines.
pub mod status;

/// Stream bus traits.
pub mod stream;

pub use config::{NodeOverrides, WriterConfig};
pub use context::{CancelLevel, CancelToken, NodeContext, UsageStats};
pub use error::{ConfigError, NodeError, OperatorError, StreamError};
pub use hooks::{CompositeHooks, ErrorKind, LogHooks, NoopHooks, PipelineHooks};
pub use node::{Node, NodeSnapshot};
pub use operator::{BatchAdapter, BatchOperator, BatchOutput, ItemOperator, ItemOutput, Operator};
pub use record::{child_anchor, Anchor, Envelope, Record, ANCHOR_KEY, CHILD_SPAN};
pub use status::Status;
pub use stream::{DataStream, RecordReader, RecordWriter, StreamState};
