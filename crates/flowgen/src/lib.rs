//! # Flowgen
//!
//! A resumable, back-pressured dataflow runtime for large-scale LLM
//! data-generation and transformation workloads.
//!
//! Flowgen composes user-supplied operators into a linear chain of
//! nodes over durable record streams, with two load-bearing guarantees:
//!
//! - **at-most-once** operator invocation per input record across
//!   crashes: the durable checkpoint advances when a batch is read, so
//!   paid work (LLM calls) is never repeated by a resume
//! - **bounded memory** end to end: bounded write queues and streaming
//!   bridges block producers instead of buffering without limit
//!
//! ## Example
//!
//! ```rust,no_run
//! use flowgen::prelude::*;
//!
//! # fn main() -> Result<(), flowgen::PipelineError> {
//! let double = Operator::map(|r: Record| {
//!     let v = r.get("v").and_then(|v| v.as_u64()).unwrap_or(0);
//!     Record::new().with("v", v * 2)
//! });
//!
//! let mut pipeline = Pipeline::new(vec![double], "input.jsonl", "output.jsonl");
//! pipeline.create("my-run", &[])?;
//! pipeline.run()?;
//! # Ok(())
//! # }
//! ```
//!
//! Interrupt handling stays with the caller: grab
//! [`Pipeline::cancel_token`] and trip it from your signal handler. The
//! first trip drains in-flight batches and checkpoints; a second trip
//! forces termination.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Pipeline-level errors.
pub mod error;

/// The progress ledger and end-of-run report.
pub mod ledger;

/// The pipeline planner, lifecycle controller, and runners.
pub mod pipeline;

/// Topology planning.
pub mod plan;

pub use error::PipelineError;
pub use ledger::ProgressLedger;
pub use pipeline::{Pipeline, PipelineOptions};
pub use plan::NodePlan;

pub use flowgen_bus::Scheme;
pub use flowgen_core::{
    child_anchor, Anchor, BatchOperator, BatchOutput, CancelToken, Envelope, ItemOperator,
    ItemOutput, NodeContext, NodeOverrides, Operator, OperatorError, PipelineHooks, Record,
    Status, UsageStats, WriterConfig, ANCHOR_KEY, CHILD_SPAN,
};

/// Common imports for building pipelines.
pub mod prelude {
    pub use crate::{Pipeline, PipelineError, PipelineOptions};
    pub use flowgen_bus::Scheme;
    pub use flowgen_core::{
        BatchOperator, BatchOutput, CancelToken, ItemOperator, ItemOutput, NodeContext,
        NodeOverrides, Operator, OperatorError, Record, Status, UsageStats, WriterConfig,
    };
}
