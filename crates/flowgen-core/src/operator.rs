//! The operator contract and the uniform batch adapter.
//!
//! Operators come in two shapes, modeled as a sum type:
//!
//! - [`BatchOperator`]: processes a whole batch in one call
//! - [`ItemOperator`]: processes one record at a time
//!
//! [`BatchAdapter`] exposes both behind a single batch interface and owns
//! anchor derivation: 1:1 outputs keep their parent's anchor, 1:N outputs
//! get child anchors under the 4-digit suffix convention. The adapter is
//! bound once when the node opens; there is no capability sniffing on the
//! hot path.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::context::NodeContext;
use crate::error::{NodeError, OperatorError};
use crate::record::{child_anchor, Anchor, Envelope, Record};

/// Output of a per-item operator for one input record.
#[derive(Debug)]
pub enum ItemOutput {
    /// One output record: the parent's anchor is propagated.
    One(Record),
    /// Child records: anchors are derived from the parent anchor.
    Many(Vec<Record>),
    /// The input record is filtered out.
    Skip,
}

/// Output of a batch operator for one input batch.
#[derive(Debug)]
pub enum BatchOutput {
    /// Strict 1:1 mapping; the length must equal the input length.
    Mapped(Vec<Record>),
    /// Per-parent children, outer length equal to the input length.
    /// An empty inner vector filters the parent out.
    Expanded(Vec<Vec<Record>>),
}

/// An operator that processes whole batches.
///
/// Must be stateless across invocations or internally thread-safe: the
/// parallel engine invokes it concurrently from several workers.
pub trait BatchOperator: Send + Sync {
    /// Processes one batch of unboxed business records.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError`] on failure; the node marks itself
    /// failed and the pipeline cancels its siblings.
    fn process_batch(
        &self,
        batch: Vec<Record>,
        ctx: &NodeContext,
    ) -> Result<BatchOutput, OperatorError>;
}

/// An operator that processes one record at a time.
///
/// The container runs it across batches: sequentially under the
/// sequential engine, fanned out over a batch-local worker pool under
/// the parallel engine.
pub trait ItemOperator: Send + Sync {
    /// Processes one unboxed business record.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError`] on failure.
    fn process_item(&self, item: Record, ctx: &NodeContext) -> Result<ItemOutput, OperatorError>;
}

impl<F> BatchOperator for F
where
    F: Fn(Vec<Record>, &NodeContext) -> Result<BatchOutput, OperatorError> + Send + Sync,
{
    fn process_batch(
        &self,
        batch: Vec<Record>,
        ctx: &NodeContext,
    ) -> Result<BatchOutput, OperatorError> {
        self(batch, ctx)
    }
}

/// The user-supplied unit a node executes.
#[derive(Clone)]
pub enum Operator {
    /// A batch-shaped operator.
    Batch(Arc<dyn BatchOperator>),
    /// A per-item operator.
    Item(Arc<dyn ItemOperator>),
}

impl Operator {
    /// Wraps a batch operator.
    #[must_use]
    pub fn batch(op: impl BatchOperator + 'static) -> Self {
        Operator::Batch(Arc::new(op))
    }

    /// Wraps a per-item operator.
    #[must_use]
    pub fn item(op: impl ItemOperator + 'static) -> Self {
        Operator::Item(Arc::new(op))
    }

    /// Convenience constructor for a 1:1 map over single records.
    #[must_use]
    pub fn map<F>(f: F) -> Self
    where
        F: Fn(Record) -> Record + Send + Sync + 'static,
    {
        struct MapOp<F>(F);
        impl<F> ItemOperator for MapOp<F>
        where
            F: Fn(Record) -> Record + Send + Sync,
        {
            fn process_item(
                &self,
                item: Record,
                _ctx: &NodeContext,
            ) -> Result<ItemOutput, OperatorError> {
                Ok(ItemOutput::One((self.0)(item)))
            }
        }
        Operator::item(MapOp(f))
    }
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operator::Batch(_) => f.write_str("Operator::Batch"),
            Operator::Item(_) => f.write_str("Operator::Item"),
        }
    }
}

/// Uniform batch interface over either operator shape.
///
/// Created at node `open` with the engine's fan-out decision baked in.
/// `apply` consumes a boxed batch and returns boxed, anchored outputs
/// ready to write.
pub struct BatchAdapter {
    op: Operator,
    fan_out: bool,
}

impl BatchAdapter {
    /// Binds an adapter. `fan_out` selects batch-local parallel
    /// execution of per-item operators (used by the parallel engine).
    #[must_use]
    pub fn bind(op: Operator, fan_out: bool) -> Self {
        Self { op, fan_out }
    }

    /// Runs the operator over one batch and boxes the outputs.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Operator`] with the batch's anchor range on
    /// operator failure or panic, and [`NodeError::Cardinality`] if a
    /// batch operator violates its 1:1 or per-parent length contract.
    pub fn apply(
        &self,
        batch: Vec<Envelope>,
        ctx: &NodeContext,
    ) -> Result<Vec<Envelope>, NodeError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let first = batch[0].anchor;
        let last = batch[batch.len() - 1].anchor;
        let wrap = |source: OperatorError| NodeError::Operator { first, last, source };

        let (anchors, records): (Vec<Anchor>, Vec<Record>) =
            batch.into_iter().map(|e| (e.anchor, e.record)).unzip();

        let outputs = match &self.op {
            Operator::Batch(op) => {
                let n = records.len();
                let out = guarded(|| op.process_batch(records, ctx)).map_err(&wrap)?;
                per_parent_outputs(out, n)?
            }
            Operator::Item(op) => {
                if self.fan_out && records.len() > 1 {
                    fan_out_items(op.as_ref(), records, ctx).map_err(&wrap)?
                } else {
                    let mut outs = Vec::with_capacity(records.len());
                    for item in records {
                        outs.push(guarded(|| op.process_item(item, ctx)).map_err(&wrap)?);
                    }
                    outs
                }
            }
        };

        Ok(box_outputs(&anchors, outputs))
    }
}

impl std::fmt::Debug for BatchAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchAdapter")
            .field("op", &self.op)
            .field("fan_out", &self.fan_out)
            .finish()
    }
}

/// Invokes user code, converting panics into [`OperatorError::Panicked`].
fn guarded<T>(f: impl FnOnce() -> Result<T, OperatorError>) -> Result<T, OperatorError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            Err(OperatorError::Panicked(msg))
        }
    }
}

/// Normalizes a batch operator's output into per-parent item outputs,
/// enforcing the length contract.
fn per_parent_outputs(out: BatchOutput, expected: usize) -> Result<Vec<ItemOutput>, NodeError> {
    match out {
        BatchOutput::Mapped(records) => {
            if records.len() != expected {
                return Err(NodeError::Cardinality {
                    expected,
                    actual: records.len(),
                });
            }
            Ok(records.into_iter().map(ItemOutput::One).collect())
        }
        BatchOutput::Expanded(children) => {
            if children.len() != expected {
                return Err(NodeError::Cardinality {
                    expected,
                    actual: children.len(),
                });
            }
            Ok(children
                .into_iter()
                .map(|c| if c.is_empty() { ItemOutput::Skip } else { ItemOutput::Many(c) })
                .collect())
        }
    }
}

/// Runs a per-item operator across a batch on a batch-local pool, one
/// worker per record, preserving input order in the result.
fn fan_out_items(
    op: &dyn ItemOperator,
    records: Vec<Record>,
    ctx: &NodeContext,
) -> Result<Vec<ItemOutput>, OperatorError> {
    let results: Vec<Result<ItemOutput, OperatorError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = records
            .into_iter()
            .map(|item| scope.spawn(move || guarded(|| op.process_item(item, ctx))))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(OperatorError::Panicked("worker panicked".into())))
            })
            .collect()
    });
    results.into_iter().collect()
}

/// Boxes per-parent outputs with their derived anchors.
fn box_outputs(anchors: &[Anchor], outputs: Vec<ItemOutput>) -> Vec<Envelope> {
    let mut boxed = Vec::with_capacity(anchors.len());
    for (parent, out) in anchors.iter().zip(outputs) {
        match out {
            ItemOutput::One(record) => boxed.push(Envelope::new(*parent, record)),
            ItemOutput::Many(children) => {
                for (j, child) in children.into_iter().enumerate() {
                    boxed.push(Envelope::new(child_anchor(*parent, j as u64), child));
                }
            }
            ItemOutput::Skip => {}
        }
    }
    boxed
}
