//! Checkpoint, cancel, and resume: the full interrupt -> resume cycle
//! with at-most-once verification.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use flowgen::prelude::*;

fn write_input(path: &Path, n: u64) {
    let mut text = String::new();
    for v in 0..n {
        text.push_str(&format!("{{\"v\":{v}}}\n"));
    }
    std::fs::write(path, text).unwrap();
}

fn read_anchors(path: &Path) -> Vec<u64> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| {
            let row: Value = serde_json::from_str(line).unwrap();
            row["_i"].as_u64().unwrap()
        })
        .collect()
}

fn options(dir: &Path) -> PipelineOptions {
    PipelineOptions {
        intermediate_dir: dir.join("tmp"),
        results_dir: dir.join("results"),
        ..PipelineOptions::default()
    }
}

fn uri(path: &Path) -> String {
    path.display().to_string()
}

/// Counts invocations and trips the cancel token when it processes the
/// record whose `v` equals `cancel_at`.
struct CancelAt {
    cancel_at: u64,
    invocations: Arc<AtomicU64>,
}

impl ItemOperator for CancelAt {
    fn process_item(&self, item: Record, ctx: &NodeContext) -> Result<ItemOutput, OperatorError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let v = item.get("v").and_then(Value::as_u64).unwrap_or(0);
        if v == self.cancel_at {
            ctx.cancel_token().trip();
        }
        Ok(ItemOutput::One(item))
    }
}

// ── Scenario 1: interrupt mid-run, then resume ──

#[test]
fn test_cancel_then_resume_is_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    write_input(&input, 1000);

    let invocations = Arc::new(AtomicU64::new(0));

    // Phase 1: run until the operator trips the cancel token at v=300
    let op = Operator::item(CancelAt {
        cancel_at: 300,
        invocations: Arc::clone(&invocations),
    });
    let mut pipeline = Pipeline::new(vec![op], uri(&input), uri(&output)).with_options(
        PipelineOptions {
            batch_size: 10,
            ..options(dir.path())
        },
    );
    pipeline.create("resume-run", &[]).unwrap();
    let err = pipeline.run().unwrap_err();
    assert!(matches!(err, PipelineError::Canceled));
    assert_eq!(pipeline.status(), Status::Canceled);

    // The canceled output is not sealed, and stops mid-stream
    assert!(!dir.path().join("output.jsonl.done").exists());
    let partial = read_anchors(&output);
    assert!(partial.len() >= 301, "the in-flight batch completes");
    assert!(partial.len() < 1000);

    // Phase 2: "restart" with a fresh pipeline object and resume
    let op = Operator::item(CancelAt {
        cancel_at: u64::MAX, // never trips again
        invocations: Arc::clone(&invocations),
    });
    let mut resumed = Pipeline::new(vec![op], uri(&input), uri(&output)).with_options(
        PipelineOptions {
            batch_size: 10,
            ..options(dir.path())
        },
    );
    resumed.resume("resume-run").unwrap();
    resumed.run().unwrap();
    assert_eq!(resumed.status(), Status::Completed);

    // No duplicates, no gaps, fully sealed
    let anchors = read_anchors(&output);
    assert_eq!(anchors, (0..1000).collect::<Vec<u64>>());
    assert!(dir.path().join("output.jsonl.done").exists());

    // At-most-once: across both attempts every record was processed
    // exactly once
    assert_eq!(invocations.load(Ordering::SeqCst), 1000);
}

// ── Scenario 2: resume output equals an uninterrupted run ──

#[test]
fn test_resume_is_idempotent_with_straight_run() {
    let straight_dir = tempfile::tempdir().unwrap();
    let resumed_dir = tempfile::tempdir().unwrap();

    let times_two = || {
        Operator::map(|r: Record| {
            let v = r.get("v").and_then(Value::as_u64).unwrap_or(0);
            Record::new().with("v", v * 2)
        })
    };

    // Reference: one uninterrupted run
    let input = straight_dir.path().join("input.jsonl");
    let straight_out = straight_dir.path().join("output.jsonl");
    write_input(&input, 200);
    let mut reference = Pipeline::new(vec![times_two()], uri(&input), uri(&straight_out))
        .with_options(PipelineOptions {
            batch_size: 7,
            ..options(straight_dir.path())
        });
    reference.create("ref", &[]).unwrap();
    reference.run().unwrap();

    // Interrupted: cancel partway, then resume to completion
    let input2 = resumed_dir.path().join("input.jsonl");
    let resumed_out = resumed_dir.path().join("output.jsonl");
    write_input(&input2, 200);

    let invocations = Arc::new(AtomicU64::new(0));
    let chain = vec![
        Operator::item(CancelAt {
            cancel_at: 60,
            invocations: Arc::clone(&invocations),
        }),
        times_two(),
    ];
    let mut first = Pipeline::new(chain, uri(&input2), uri(&resumed_out)).with_options(
        PipelineOptions {
            batch_size: 7,
            ..options(resumed_dir.path())
        },
    );
    first.create("cut", &[]).unwrap();
    first.run().unwrap_err();

    let chain = vec![
        Operator::item(CancelAt {
            cancel_at: u64::MAX,
            invocations: Arc::clone(&invocations),
        }),
        times_two(),
    ];
    let mut second = Pipeline::new(chain, uri(&input2), uri(&resumed_out)).with_options(
        PipelineOptions {
            batch_size: 7,
            ..options(resumed_dir.path())
        },
    );
    second.resume("cut").unwrap();
    second.run().unwrap();

    // Bit-identical final outputs
    let a = std::fs::read(&straight_out).unwrap();
    let b = std::fs::read(&resumed_out).unwrap();
    assert_eq!(a, b);
}

// ── Scenario 3: completed nodes are skipped on resume ──

#[test]
fn test_resume_skips_completed_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    write_input(&input, 20);

    let invocations = Arc::new(AtomicU64::new(0));
    let counting = |invocations: &Arc<AtomicU64>| {
        let invocations = Arc::clone(invocations);
        Operator::map(move |r: Record| {
            invocations.fetch_add(1, Ordering::SeqCst);
            r
        })
    };

    let mut pipeline = Pipeline::new(
        vec![counting(&invocations), counting(&invocations)],
        uri(&input),
        uri(&output),
    )
    .with_options(options(dir.path()));
    pipeline.create("skip", &[]).unwrap();
    pipeline.run().unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 40);

    // Resuming a completed pipeline re-runs nothing
    let mut again = Pipeline::new(
        vec![counting(&invocations), counting(&invocations)],
        uri(&input),
        uri(&output),
    )
    .with_options(options(dir.path()));
    again.resume("skip").unwrap();
    again.run().unwrap();
    assert_eq!(again.status(), Status::Completed);
    assert_eq!(invocations.load(Ordering::SeqCst), 40);
}

// ── Scenario 4: manifest paths override code-level URIs ──

#[test]
fn test_manifest_paths_are_authoritative_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    let decoy = dir.path().join("decoy.jsonl");
    write_input(&input, 50);

    let invocations = Arc::new(AtomicU64::new(0));
    let op = Operator::item(CancelAt {
        cancel_at: 20,
        invocations: Arc::clone(&invocations),
    });
    let mut pipeline = Pipeline::new(vec![op], uri(&input), uri(&output)).with_options(
        PipelineOptions {
            batch_size: 5,
            ..options(dir.path())
        },
    );
    pipeline.create("authority", &[]).unwrap();
    pipeline.run().unwrap_err();

    // Resume with a different output URI in code; the manifest wins
    let op = Operator::item(CancelAt {
        cancel_at: u64::MAX,
        invocations: Arc::clone(&invocations),
    });
    let mut resumed = Pipeline::new(vec![op], uri(&input), uri(&decoy)).with_options(
        PipelineOptions {
            batch_size: 5,
            ..options(dir.path())
        },
    );
    resumed.resume("authority").unwrap();
    resumed.run().unwrap();

    assert!(!decoy.exists());
    assert_eq!(read_anchors(&output), (0..50).collect::<Vec<u64>>());
}

// ── Scenario 5: checkpoint-stream disagreement refuses to run ──

#[test]
fn test_checkpoint_mismatch_refuses_to_run() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    write_input(&input, 100);

    let invocations = Arc::new(AtomicU64::new(0));
    let op = Operator::item(CancelAt {
        cancel_at: 50,
        invocations: Arc::clone(&invocations),
    });
    let mut pipeline = Pipeline::new(vec![op], uri(&input), uri(&output)).with_options(
        PipelineOptions {
            batch_size: 10,
            ..options(dir.path())
        },
    );
    pipeline.create("tamper", &[]).unwrap();
    pipeline.run().unwrap_err();

    // Tamper: replace the input with something shorter than the
    // checkpointed progress
    write_input(&input, 10);

    let op = Operator::item(CancelAt {
        cancel_at: u64::MAX,
        invocations: Arc::clone(&invocations),
    });
    let mut resumed = Pipeline::new(vec![op], uri(&input), uri(&output)).with_options(
        PipelineOptions {
            batch_size: 10,
            ..options(dir.path())
        },
    );
    resumed.resume("tamper").unwrap();
    let err = resumed.run().unwrap_err();

    match err {
        PipelineError::Node { source, .. } => {
            assert!(source
                .to_string()
                .contains("checkpoint mismatch"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(resumed.status(), Status::Failed);
}

// ── Scenario 6: operator list must match the manifest ──

#[test]
fn test_operator_count_mismatch_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    write_input(&input, 5);

    let identity = || Operator::map(|r: Record| r);
    let mut pipeline = Pipeline::new(vec![identity()], uri(&input), uri(&output))
        .with_options(options(dir.path()));
    pipeline.create("shape", &[]).unwrap();
    pipeline.run().unwrap();

    let mut wrong = Pipeline::new(vec![identity(), identity()], uri(&input), uri(&output))
        .with_options(options(dir.path()));
    assert!(matches!(
        wrong.resume("shape").unwrap_err(),
        PipelineError::OperatorCountMismatch {
            manifest: 1,
            code: 2
        }
    ));
}
