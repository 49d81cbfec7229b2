use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::{Array, Int64Array};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use futures::StreamExt;
use strata_common::{EngineConfig, OperatorId, QueryId, StrataError, TaskId};
use strata_execution::{
    Driver, DriverContext, DriverState, ExecNode, Operator, OperatorRegistry, PipelineExec,
    PlanNode, RowNumberNode, RowNumberOperator, TaskContext, ValuesNode, ValuesOperator,
    YieldPolicy,
};

fn unique_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}_{nanos}"))
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]))
}

/// `num_batches` batches; row `i` overall has `k = i % groups` and `v = i`.
fn input_batches(num_batches: usize, rows: usize, groups: i64) -> Vec<RecordBatch> {
    (0..num_batches)
        .map(|b| {
            let start = (b * rows) as i64;
            let v = (start..start + rows as i64).collect::<Vec<_>>();
            let k = v.iter().map(|i| i % groups).collect::<Vec<_>>();
            RecordBatch::try_new(
                schema(),
                vec![Arc::new(Int64Array::from(k)), Arc::new(Int64Array::from(v))],
            )
            .expect("batch")
        })
        .collect()
}

fn column(batch: &RecordBatch, i: usize) -> &Int64Array {
    batch
        .column(i)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column")
}

/// key -> (row_number, v) sorted by row number.
fn rows_by_key(batches: &[RecordBatch]) -> BTreeMap<i64, Vec<(i64, i64)>> {
    let mut out = BTreeMap::<i64, Vec<(i64, i64)>>::new();
    for batch in batches {
        let (k, v, rn) = (column(batch, 0), column(batch, 1), column(batch, 2));
        for row in 0..batch.num_rows() {
            out.entry(k.value(row))
                .or_default()
                .push((rn.value(row), v.value(row)));
        }
    }
    for rows in out.values_mut() {
        rows.sort_unstable();
    }
    out
}

fn config(spill_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.spill.spill_dir = spill_dir.to_string_lossy().to_string();
    config
}

fn row_number_plan(batches: Vec<RecordBatch>, limit: Option<i64>) -> Vec<Arc<dyn PlanNode>> {
    let values = ValuesNode::new("values", schema(), batches).expect("values node");
    let row_number = RowNumberNode::new("rn", schema(), vec![0], limit, true, "row_number")
        .expect("row number node");
    vec![Arc::new(values), Arc::new(row_number)]
}

fn run_pipeline(
    config: EngineConfig,
    nodes: Vec<Arc<dyn PlanNode>>,
) -> strata_common::Result<Vec<RecordBatch>> {
    let task = TaskContext::new(QueryId(11), TaskId(0), config)?;
    let exec = PipelineExec::try_new(nodes, Arc::new(OperatorRegistry::with_builtins()))?;
    let stream = exec.execute(task)?;
    futures::executor::block_on(stream.collect::<Vec<_>>())
        .into_iter()
        .collect()
}

fn expected_top_five() -> BTreeMap<i64, Vec<(i64, i64)>> {
    (0..10)
        .map(|g| (g, (1..=5).map(|n| (n, g + 10 * (n - 1))).collect()))
        .collect()
}

#[test]
fn limit_keeps_first_rows_of_every_partition() {
    let dir = unique_dir("strata_rn_limit");
    let out = run_pipeline(config(&dir), row_number_plan(input_batches(5, 1000, 10), Some(5)))
        .expect("pipeline");
    assert_eq!(out.iter().map(RecordBatch::num_rows).sum::<usize>(), 50);
    assert_eq!(rows_by_key(&out), expected_top_five());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn limit_is_unchanged_by_forced_spill() {
    let dir = unique_dir("strata_rn_limit_spill");
    let mut config = config(&dir);
    config.spill.testing_trigger_spill = true;
    config.spill.max_spill_level = Some(1);
    let out = run_pipeline(config, row_number_plan(input_batches(5, 1000, 10), Some(5)))
        .expect("pipeline");
    assert_eq!(out.iter().map(RecordBatch::num_rows).sum::<usize>(), 50);
    assert_eq!(rows_by_key(&out), expected_top_five());
    assert_eq!(count_files(&dir), 0);
    let _ = std::fs::remove_dir_all(&dir);
}

struct SpilledRun {
    output: Vec<RecordBatch>,
    spilled_rows: u64,
    max_level_exceeded: u64,
    yields: usize,
}

/// Drive Values -> RowNumber by hand, asking the row number pool to reclaim
/// after `reclaim_after` yields.
fn drive(
    config: EngineConfig,
    policy: YieldPolicy,
    batches: Vec<RecordBatch>,
    reclaim_after: Option<usize>,
) -> SpilledRun {
    let task = TaskContext::new(QueryId(12), TaskId(1), config).expect("task");
    let ctx = DriverContext::new(
        task,
        0,
        Arc::new(OperatorRegistry::with_builtins()),
        policy,
    );
    let node = RowNumberNode::new("rn", schema(), vec![0], None, true, "row_number")
        .expect("row number node");
    let row_number = RowNumberOperator::new(OperatorId(1), &ctx, &node).expect("operator");
    let stats = row_number.spill_stats_handle();
    let operators: Vec<Box<dyn Operator>> = vec![
        Box::new(ValuesOperator::new(schema(), batches)),
        Box::new(row_number),
    ];
    let mut driver = Driver::new(ctx, operators).expect("driver");

    let mut output = Vec::new();
    let mut yields = 0;
    loop {
        let state = driver.run().expect("run");
        output.extend(driver.take_output());
        match state {
            DriverState::Finished => break,
            DriverState::Yielded => {
                yields += 1;
                if reclaim_after == Some(yields) {
                    driver.operators()[1]
                        .pool()
                        .expect("row number pool")
                        .request_reclaim(1);
                }
            }
            DriverState::Blocked(reason) => panic!("unexpected block {reason:?}"),
        }
    }
    let stats = *stats.lock().expect("stats");
    SpilledRun {
        output,
        spilled_rows: stats.spilled_rows,
        max_level_exceeded: stats.spill_max_level_exceeded_count,
        yields,
    }
}

fn max_row_numbers(batches: &[RecordBatch]) -> BTreeMap<i64, (i64, usize)> {
    rows_by_key(batches)
        .into_iter()
        .map(|(k, rows)| {
            let numbers = rows.iter().map(|(n, _)| *n).collect::<Vec<_>>();
            assert_eq!(numbers, (1..=rows.len() as i64).collect::<Vec<_>>(), "key {k}");
            (k, (numbers.last().copied().unwrap_or_default(), rows.len()))
        })
        .collect()
}

#[test]
fn reclaim_mid_stream_preserves_partition_counts() {
    let dir = unique_dir("strata_rn_reclaim");
    let batches = input_batches(20, 500, 37);

    let baseline = drive(config(&dir), YieldPolicy::EveryNChecks(1), batches.clone(), None);
    assert_eq!(baseline.spilled_rows, 0);

    let spilled = drive(config(&dir), YieldPolicy::EveryNChecks(1), batches, Some(5));
    assert!(spilled.spilled_rows > 0);
    assert_eq!(
        spilled.output.iter().map(RecordBatch::num_rows).sum::<usize>(),
        10_000
    );
    assert_eq!(
        max_row_numbers(&spilled.output),
        max_row_numbers(&baseline.output)
    );
    assert_eq!(count_files(&dir), 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn recursive_spill_resumes_after_yields() {
    let dir = unique_dir("strata_rn_yield");
    let batches = input_batches(8, 250, 13);
    let baseline = drive(config(&dir), YieldPolicy::Never, batches.clone(), None);

    let mut spill_config = config(&dir);
    spill_config.spill.testing_trigger_spill = true;
    spill_config.spill.max_spill_level = Some(2);
    let spilled = drive(spill_config, YieldPolicy::EveryNChecks(2), batches, None);
    assert!(spilled.yields > 0);
    assert!(spilled.spilled_rows > 0);
    assert_eq!(
        max_row_numbers(&spilled.output),
        max_row_numbers(&baseline.output)
    );
    assert_eq!(count_files(&dir), 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn spill_level_limit_falls_back_to_memory() {
    let dir = unique_dir("strata_rn_max_level");
    let batches = input_batches(8, 250, 13);
    let baseline = drive(config(&dir), YieldPolicy::Never, batches.clone(), None);
    assert_eq!(baseline.max_level_exceeded, 0);

    let mut spill_config = config(&dir);
    spill_config.spill.testing_trigger_spill = true;
    spill_config.spill.max_spill_level = Some(0);
    let limited = drive(spill_config, YieldPolicy::Never, batches, None);
    assert!(limited.spilled_rows > 0);
    assert!(limited.max_level_exceeded > 0);
    assert_eq!(
        limited.output.iter().map(RecordBatch::num_rows).sum::<usize>(),
        2000
    );
    assert_eq!(
        max_row_numbers(&limited.output),
        max_row_numbers(&baseline.output)
    );
    assert_eq!(count_files(&dir), 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unspillable_table_over_budget_fails_the_task() {
    let dir = unique_dir("strata_rn_oom");
    let mut config = config(&dir);
    config.spill.enabled = false;
    config.mem_budget_bytes = 4 * 1024;
    let err = run_pipeline(config, row_number_plan(input_batches(2, 1000, 500), None))
        .expect_err("over budget");
    assert!(matches!(err, StrataError::ResourceExhausted(_)), "{err}");
    assert!(err.to_string().contains("RowNumber"));
}

#[test]
fn single_partition_limit_finishes_early() {
    let values = ValuesNode::new("values", schema(), input_batches(4, 5, 3)).expect("values");
    let row_number = RowNumberNode::new("rn", schema(), Vec::new(), Some(7), true, "row_number")
        .expect("row number node");
    let out = run_pipeline(
        EngineConfig::default(),
        vec![Arc::new(values), Arc::new(row_number)],
    )
    .expect("pipeline");
    let numbers = out
        .iter()
        .flat_map(|b| {
            let rn = column(b, 2);
            (0..rn.len()).map(|i| rn.value(i)).collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    assert_eq!(numbers, (1..=7).collect::<Vec<_>>());
}
