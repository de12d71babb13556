//! Topology planning: node ids, URI welding, and path priority.
//!
//! A pipeline is a linear chain of one node per operator. Stream URIs
//! are decided by priority:
//!
//! 1. a per-node explicit URI supplied by the caller
//! 2. the pipeline boundary URIs, applied to the first and last node
//! 3. an auto-generated intermediate,
//!    `{scheme}://{base}/{pipeline_id}/{node_id}{ext}`
//!
//! Welding then requires each adjacent pair to agree on their shared
//! edge; a conflict is a planning error, never silently resolved.

use std::path::Path;

use serde_json::{Map, Value};

use flowgen_bus::{resolve_uri, Scheme};
use flowgen_core::{ConfigError, NodeOverrides};

/// The resolved plan for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodePlan {
    /// The node's id (`node_0`, `node_1`, ...).
    pub node_id: String,
    /// Input stream URI.
    pub input_uri: String,
    /// Output stream URI.
    pub output_uri: String,
    /// Records per batch.
    pub batch_size: usize,
    /// Worker pool size.
    pub parallel_size: usize,
    /// Whether this node's output is a welded intermediate edge (as
    /// opposed to the pipeline's output boundary).
    pub intermediate_output: bool,
    /// Opaque operator parameters.
    pub extra: Map<String, Value>,
}

/// Pipeline-level defaults applied where no override is given.
#[derive(Debug, Clone)]
pub struct PlanDefaults<'a> {
    /// Default records per batch.
    pub batch_size: usize,
    /// Default worker pool size.
    pub parallel_size: usize,
    /// Scheme for auto-generated intermediates.
    pub default_scheme: Scheme,
    /// Base directory for auto-generated intermediates.
    pub intermediate_dir: &'a Path,
}

/// Plans the linear chain for `operator_count` operators.
///
/// # Errors
///
/// Returns [`ConfigError`] for an empty chain, an out-of-range
/// scheduling parameter, a welding conflict, or an unresolvable URI.
pub fn plan_chain(
    pipeline_id: &str,
    operator_count: usize,
    input_uri: &str,
    output_uri: &str,
    defaults: &PlanDefaults<'_>,
    overrides: &[NodeOverrides],
) -> Result<Vec<NodePlan>, ConfigError> {
    if operator_count == 0 {
        return Err(ConfigError::InvalidParameter {
            name: "operators",
            value: 0,
        });
    }

    struct Draft {
        node_id: String,
        input: Option<String>,
        output: Option<String>,
        batch_size: usize,
        parallel_size: usize,
        extra: Map<String, Value>,
    }

    let mut drafts: Vec<Draft> = Vec::with_capacity(operator_count);
    for i in 0..operator_count {
        let ov = overrides.get(i);
        let batch_size = ov.and_then(|o| o.batch_size).unwrap_or(defaults.batch_size);
        let parallel_size = ov
            .and_then(|o| o.parallel_size)
            .unwrap_or(defaults.parallel_size);
        if batch_size == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "batch_size",
                value: 0,
            });
        }
        if parallel_size == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "parallel_size",
                value: 0,
            });
        }
        drafts.push(Draft {
            node_id: format!("node_{i}"),
            input: ov.and_then(|o| o.input_uri.clone()),
            output: ov.and_then(|o| o.output_uri.clone()),
            batch_size,
            parallel_size,
            extra: ov.map(|o| o.extra.clone()).unwrap_or_default(),
        });
    }

    // Boundary URIs bind where no explicit override claimed the slot.
    if drafts[0].input.is_none() {
        drafts[0].input = Some(input_uri.to_string());
    }
    let last = drafts.len() - 1;
    if drafts[last].output.is_none() {
        drafts[last].output = Some(output_uri.to_string());
    }

    // Weld adjacent edges: each pair must agree on the shared stream.
    for i in 1..drafts.len() {
        let (left, right) = drafts.split_at_mut(i);
        let prev = &mut left[i - 1];
        let curr = &mut right[0];
        match (&curr.input, &prev.output) {
            (Some(a), Some(b)) if a != b => {
                return Err(ConfigError::UriMismatch {
                    upstream: prev.node_id.clone(),
                    downstream: curr.node_id.clone(),
                    upstream_uri: b.clone(),
                    downstream_uri: a.clone(),
                });
            }
            (Some(a), None) => prev.output = Some(a.clone()),
            (None, Some(b)) => curr.input = Some(b.clone()),
            _ => {}
        }
    }

    // Auto-generate the remaining intermediates.
    for i in 0..drafts.len() - 1 {
        if drafts[i].output.is_none() {
            let scheme = defaults.default_scheme;
            let uri = format!(
                "{}://{}/{}/{}{}",
                scheme.as_str(),
                defaults.intermediate_dir.display(),
                pipeline_id,
                drafts[i].node_id,
                scheme.extension(),
            );
            drafts[i].output = Some(uri.clone());
            drafts[i + 1].input = Some(uri);
        }
    }

    let boundary_output = drafts[last]
        .output
        .clone()
        .unwrap_or_else(|| output_uri.to_string());

    let mut plans = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let input = draft.input.unwrap_or_else(|| input_uri.to_string());
        let output = draft.output.unwrap_or_else(|| output_uri.to_string());
        // Every URI must route, before anything is materialized.
        for uri in [&input, &output] {
            resolve_uri(uri).map_err(|_| ConfigError::UnknownScheme(uri.clone()))?;
        }
        let intermediate_output = output != boundary_output;
        plans.push(NodePlan {
            node_id: draft.node_id,
            input_uri: input,
            output_uri: output,
            batch_size: draft.batch_size,
            parallel_size: draft.parallel_size,
            intermediate_output,
            extra: draft.extra,
        });
    }
    Ok(plans)
}

/// Rejects volatile (memory-backed) intermediates on a recoverable
/// pipeline: recovery needs durable intermediates, and downgrading
/// silently would discard that guarantee.
///
/// # Errors
///
/// Returns [`ConfigError::VolatileIntermediate`] naming the offending
/// node and URI.
pub fn check_recoverable(plans: &[NodePlan]) -> Result<(), ConfigError> {
    for plan in plans {
        if !plan.intermediate_output {
            continue;
        }
        if let Ok(resolved) = resolve_uri(&plan.output_uri) {
            if resolved.scheme == Scheme::Memory {
                return Err(ConfigError::VolatileIntermediate {
                    node_id: plan.node_id.clone(),
                    uri: plan.output_uri.clone(),
                });
            }
        }
    }
    Ok(())
}
