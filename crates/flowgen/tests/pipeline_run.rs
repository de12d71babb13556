//! End-to-end pipeline runs in sequential mode: anchor propagation,
//! 1:N explosion, welded intermediates, overrides, and reporting.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use flowgen::prelude::*;

fn init_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn write_input(path: &Path, n: u64) {
    let mut text = String::new();
    for v in 1..=n {
        text.push_str(&format!("{{\"v\":{v}}}\n"));
    }
    std::fs::write(path, text).unwrap();
}

fn read_output(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn anchors(rows: &[Value]) -> Vec<u64> {
    rows.iter().map(|r| r["_i"].as_u64().unwrap()).collect()
}

fn options(dir: &Path) -> PipelineOptions {
    PipelineOptions {
        intermediate_dir: dir.join("tmp"),
        results_dir: dir.join("results"),
        ..PipelineOptions::default()
    }
}

fn times_ten() -> Operator {
    Operator::map(|r: Record| {
        let v = r.get("v").and_then(Value::as_u64).unwrap_or(0);
        Record::new().with("v", v * 10)
    })
}

fn uri(path: &Path) -> String {
    path.display().to_string()
}

// ── Scenario 1: Straight JSONL ──

#[test]
fn test_straight_jsonl_pipeline() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    write_input(&input, 3);

    let mut pipeline = Pipeline::new(vec![times_ten()], uri(&input), uri(&output))
        .with_options(PipelineOptions {
            batch_size: 2,
            ..options(dir.path())
        });
    pipeline.create("straight", &[]).unwrap();
    pipeline.run().unwrap();

    assert_eq!(pipeline.status(), Status::Completed);
    let text = std::fs::read_to_string(&output).unwrap();
    assert_eq!(
        text,
        "{\"_i\":0,\"v\":10}\n{\"_i\":1,\"v\":20}\n{\"_i\":2,\"v\":30}\n"
    );

    // Sealed output and durable progress
    assert!(dir.path().join("output.jsonl.done").exists());
    let manifest: Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("results/straight/runtime.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["nodes"][0]["progress"], json!(3));
    assert_eq!(manifest["nodes"][0]["status"], json!("completed"));
    assert_eq!(manifest["status"], json!("completed"));
}

// ── Scenario 2: 1:N explode ──

#[test]
fn test_explode_anchor_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    write_input(&input, 3);

    struct Explode;
    impl ItemOperator for Explode {
        fn process_item(
            &self,
            _item: Record,
            _ctx: &NodeContext,
        ) -> Result<ItemOutput, OperatorError> {
            Ok(ItemOutput::Many(vec![
                Record::new().with("text", "x"),
                Record::new().with("text", "x"),
            ]))
        }
    }

    let mut pipeline = Pipeline::new(vec![Operator::item(Explode)], uri(&input), uri(&output))
        .with_options(options(dir.path()));
    pipeline.create("explode", &[]).unwrap();
    pipeline.run().unwrap();

    let rows = read_output(&output);
    assert_eq!(anchors(&rows), vec![0, 1, 10_000, 10_001, 20_000, 20_001]);
    for row in &rows {
        assert_eq!(row["text"], json!("x"));
    }
}

// ── Welded chain ──

#[test]
fn test_two_node_chain_with_intermediate() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    write_input(&input, 5);

    let plus_one = Operator::map(|r: Record| {
        let v = r.get("v").and_then(Value::as_u64).unwrap_or(0);
        Record::new().with("v", v + 1)
    });

    let mut pipeline =
        Pipeline::new(vec![plus_one, times_ten()], uri(&input), uri(&output))
            .with_options(PipelineOptions {
                batch_size: 2,
                ..options(dir.path())
            });
    pipeline.create("chain", &[]).unwrap();
    pipeline.run().unwrap();

    let rows = read_output(&output);
    assert_eq!(anchors(&rows), vec![0, 1, 2, 3, 4]);
    let values: Vec<u64> = rows.iter().map(|r| r["v"].as_u64().unwrap()).collect();
    assert_eq!(values, vec![20, 30, 40, 50, 60]);

    // The welded intermediate is a real sealed stream
    let intermediate = dir.path().join("tmp/chain/node_0.jsonl");
    assert!(intermediate.exists());
    assert!(PathBuf::from(format!("{}.done", intermediate.display())).exists());
}

// ── Parallel engine ──

#[test]
fn test_parallel_engine_preserves_anchor_order() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    write_input(&input, 60);

    let jitter = Operator::map(|r: Record| {
        let v = r.get("v").and_then(Value::as_u64).unwrap_or(0);
        std::thread::sleep(std::time::Duration::from_micros(300 * (v % 5)));
        r
    });

    let mut pipeline = Pipeline::new(vec![jitter], uri(&input), uri(&output)).with_options(
        PipelineOptions {
            batch_size: 5,
            parallel_size: 4,
            ..options(dir.path())
        },
    );
    pipeline.create("parallel", &[]).unwrap();
    pipeline.run().unwrap();

    let rows = read_output(&output);
    assert_eq!(anchors(&rows), (0..60).collect::<Vec<u64>>());
}

// ── CSV boundary ──

#[test]
fn test_csv_output_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.csv");
    write_input(&input, 3);

    let mut pipeline = Pipeline::new(vec![times_ten()], uri(&input), uri(&output))
        .with_options(options(dir.path()));
    pipeline.create("csv-out", &[]).unwrap();
    pipeline.run().unwrap();

    let text = std::fs::read_to_string(&output).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("_i,v"));
    assert_eq!(lines.next(), Some("0,10"));
    assert_eq!(lines.next(), Some("1,20"));
    assert_eq!(lines.next(), Some("2,30"));
    assert!(dir.path().join("output.csv.done").exists());
}

// ── Filtering ──

#[test]
fn test_filter_keeps_parent_anchors() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    write_input(&input, 6);

    struct KeepOdd;
    impl ItemOperator for KeepOdd {
        fn process_item(
            &self,
            item: Record,
            _ctx: &NodeContext,
        ) -> Result<ItemOutput, OperatorError> {
            let v = item.get("v").and_then(Value::as_u64).unwrap_or(0);
            if v % 2 == 1 {
                Ok(ItemOutput::One(item))
            } else {
                Ok(ItemOutput::Skip)
            }
        }
    }

    let mut pipeline = Pipeline::new(vec![Operator::item(KeepOdd)], uri(&input), uri(&output))
        .with_options(options(dir.path()));
    pipeline.create("filter", &[]).unwrap();
    pipeline.run().unwrap();

    // Values 1,3,5 sit at input ordinals 0,2,4; anchors are preserved,
    // leaving gaps where records were dropped
    let rows = read_output(&output);
    assert_eq!(anchors(&rows), vec![0, 2, 4]);
}

// ── Overrides and extras ──

#[test]
fn test_node_overrides_reach_operator_and_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    write_input(&input, 4);

    let seen_extra = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&seen_extra);

    struct Tagger {
        seen: Arc<AtomicU64>,
    }
    impl ItemOperator for Tagger {
        fn process_item(
            &self,
            item: Record,
            ctx: &NodeContext,
        ) -> Result<ItemOutput, OperatorError> {
            if let Some(n) = ctx.extra().get("variant").and_then(Value::as_u64) {
                self.seen.store(n, Ordering::SeqCst);
            }
            Ok(ItemOutput::One(item))
        }
    }

    let mut pipeline = Pipeline::new(
        vec![Operator::item(Tagger { seen })],
        uri(&input),
        uri(&output),
    )
    .with_options(options(dir.path()));
    let overrides = vec![NodeOverrides::new().batch_size(3).extra("variant", 7)];
    pipeline.create("extras", &overrides).unwrap();
    pipeline.run().unwrap();

    assert_eq!(seen_extra.load(Ordering::SeqCst), 7);

    let manifest: Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("results/extras/runtime.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["nodes"][0]["batch_size"], json!(3));
    assert_eq!(manifest["nodes"][0]["extra"]["variant"], json!(7));
}

// ── Usage accounting ──

#[test]
fn test_usage_totals_reach_report() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    write_input(&input, 5);

    struct Metered;
    impl ItemOperator for Metered {
        fn process_item(
            &self,
            item: Record,
            ctx: &NodeContext,
        ) -> Result<ItemOutput, OperatorError> {
            let mut stats = UsageStats::new();
            stats.add("total_tokens", 11.0);
            ctx.report_usage(&stats);
            Ok(ItemOutput::One(item))
        }
    }

    let mut pipeline = Pipeline::new(vec![Operator::item(Metered)], uri(&input), uri(&output))
        .with_options(options(dir.path()));
    pipeline.create("usage", &[]).unwrap();
    pipeline.run().unwrap();

    let report: Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("results/usage/report.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(report["status"], json!("completed"));
    assert_eq!(report["nodes"]["node_0"]["usage"]["total_tokens"], json!(55.0));
    assert_eq!(report["nodes"]["node_0"]["progress"], json!(5));
}

// ── Operator failure ──

#[test]
fn test_operator_failure_fails_pipeline_without_sealing() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");
    write_input(&input, 3);

    struct Flaky;
    impl ItemOperator for Flaky {
        fn process_item(
            &self,
            item: Record,
            _ctx: &NodeContext,
        ) -> Result<ItemOutput, OperatorError> {
            let v = item.get("v").and_then(Value::as_u64).unwrap_or(0);
            if v == 2 {
                return Err(OperatorError::msg("backend refused"));
            }
            Ok(ItemOutput::One(item))
        }
    }

    let mut pipeline = Pipeline::new(vec![Operator::item(Flaky)], uri(&input), uri(&output))
        .with_options(options(dir.path()));
    pipeline.create("flaky", &[]).unwrap();

    let err = pipeline.run().unwrap_err();
    assert!(matches!(err, PipelineError::Node { .. }));
    assert_eq!(pipeline.status(), Status::Failed);
    // A failed node's output is never sealed
    assert!(!dir.path().join("output.jsonl.done").exists());
}
