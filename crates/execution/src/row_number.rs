//! Row number operator with hash-table and input spilling.
//!
//! Rows are numbered within the partition given by the key columns in
//! arrival order, starting at 1. With a limit, rows past the limit of their
//! partition are dropped. Without keys all rows form a single partition and
//! the operator finishes early once the limit is reached.
//!
//! Under memory pressure the partition table is spilled as `(keys..., count)`
//! rows, and every following input batch is spilled by the same hash
//! partitioning. Once input ends, spilled partitions are restored one at a
//! time: table counts first, then the partition's input, which may spill
//! again at the next level of hash bits.

use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, Int64Array, UInt32Array};
use arrow::compute::take;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use strata_common::spill_stats::succinct_bytes;
use strata_common::{
    global_metrics, MemoryPool, OperatorId, ReclaimableSectionGuard, Result, SpillConfig,
    SpillStats, StrataError,
};
use strata_spill::{
    HashTableSpiller, InputSpiller, SpillPartitionId, SpillPartitionSet, SpillStatsHandle,
    UnorderedSpillReader,
};
use tracing::{debug, warn};

use crate::context::DriverContext;
use crate::driver::YieldSignal;
use crate::operator::{Operator, ReclaimStats};
use crate::partition_table::PartitionTable;
use crate::plan::{PlanNode, RowNumberNode};

const OPERATOR_NAME: &str = "RowNumber";

/// Restore counters of a [`RowNumberOperator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowNumberStats {
    /// Spilled partitions restored so far.
    pub restored_partitions: u64,
    /// Deepest spill level of a restored partition.
    pub max_spill_level: u8,
}

/// Operator numbering rows per partition, spilling when memory runs out.
pub struct RowNumberOperator {
    pool: Arc<MemoryPool>,
    input_schema: SchemaRef,
    output_schema: SchemaRef,
    limit: Option<i64>,
    generate_row_number: bool,
    /// `None` without partition keys.
    table: Option<PartitionTable>,
    input: Option<RecordBatch>,
    group_hits: Vec<usize>,
    num_total_input: i64,
    finished_early: bool,
    no_more_input: bool,

    /// Set when the operator may spill.
    spill_config: Option<SpillConfig>,
    spill_stats: SpillStatsHandle,
    exceeded_max_spill_level: bool,
    restoring_partition: Option<SpillPartitionId>,
    hash_table_spill_set: SpillPartitionSet,
    input_spill_set: SpillPartitionSet,
    input_spiller: Option<InputSpiller>,
    spill_input_reader: Option<UnorderedSpillReader>,
    yield_requested: bool,
    yield_signal: Arc<YieldSignal>,
    stats: RowNumberStats,
}

impl RowNumberOperator {
    /// Operator for `node` at position `operator_id` of the driver.
    pub fn new(
        operator_id: OperatorId,
        ctx: &Arc<DriverContext>,
        node: &RowNumberNode,
    ) -> Result<Self> {
        let config = &ctx.task.config;
        let pool = ctx
            .task
            .memory
            .add_pool(ctx.pool_name(OPERATOR_NAME, operator_id.0));
        let can_spill = node.can_spill(&config.spill);
        pool.set_reclaimable(can_spill);

        let table = if node.partition_keys().is_empty() {
            None
        } else {
            Some(PartitionTable::try_new(
                node.input_schema(),
                node.partition_keys().to_vec(),
            )?)
        };

        Ok(Self {
            pool,
            input_schema: node.input_schema().clone(),
            output_schema: node.output_schema(),
            limit: node.limit(),
            generate_row_number: node.generate_row_number(),
            table,
            input: None,
            group_hits: Vec::new(),
            num_total_input: 0,
            finished_early: false,
            no_more_input: false,
            spill_config: can_spill.then(|| config.spill.clone()),
            spill_stats: Arc::new(Mutex::new(SpillStats::default())),
            exceeded_max_spill_level: false,
            restoring_partition: None,
            hash_table_spill_set: SpillPartitionSet::new(),
            input_spill_set: SpillPartitionSet::new(),
            input_spiller: None,
            spill_input_reader: None,
            yield_requested: false,
            yield_signal: ctx.yield_signal.clone(),
            stats: RowNumberStats::default(),
        })
    }

    /// Restore counters.
    pub fn stats(&self) -> RowNumberStats {
        self.stats
    }

    /// Shared handle to the operator's spill statistics.
    ///
    /// Stays valid after the operator is boxed and handed to a driver.
    pub fn spill_stats_handle(&self) -> SpillStatsHandle {
        self.spill_stats.clone()
    }

    /// Snapshot of the spill statistics.
    pub fn spill_stats(&self) -> SpillStats {
        *self.spill_stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spill_enabled(&self) -> bool {
        self.spill_config.is_some()
    }

    fn ensure_input_fits(&mut self, input: &RecordBatch) -> Result<()> {
        let Some(config) = self.spill_config.as_ref() else {
            return Ok(());
        };
        if self.input_spiller.is_some() {
            return Ok(());
        }
        let Some(table) = self.table.as_ref() else {
            return Ok(());
        };
        if table.num_distinct() == 0 {
            return Ok(());
        }

        if config.testing_trigger_spill {
            let pool = self.pool.clone();
            let _guard = ReclaimableSectionGuard::new(&pool);
            return self.reclaim_self();
        }

        let current_usage = self.pool.used_bytes();
        let min_reservation = current_usage * config.min_spillable_reservation_pct as usize / 100;
        let increment = table.size_increase(input.num_rows());
        if self.pool.available_reservation() >= min_reservation.max(increment) {
            return Ok(());
        }

        let target = (increment * 2)
            .max(current_usage * config.spillable_reservation_growth_pct as usize / 100);
        {
            let _guard = ReclaimableSectionGuard::new(&self.pool);
            if self.pool.maybe_reserve(target) {
                return Ok(());
            }
        }

        warn!(
            pool = self.pool.name(),
            target = %succinct_bytes(target as u64),
            usage = %succinct_bytes(current_usage as u64),
            reservation = %succinct_bytes(self.pool.reserved_bytes() as u64),
            "failed to reserve memory for row number input, spilling"
        );
        global_metrics().inc_reservation_failures(self.pool.name());
        let pool = self.pool.clone();
        let _guard = ReclaimableSectionGuard::new(&pool);
        self.reclaim_self()
    }

    /// Spill unless the table is empty or the spill level limit is hit.
    fn reclaim_self(&mut self) -> Result<()> {
        let Some(table) = self.table.as_ref() else {
            return Ok(());
        };
        if table.num_distinct() == 0 {
            return Ok(());
        }
        if self.exceeded_max_spill_level {
            let max_level = self
                .spill_config
                .as_ref()
                .and_then(|c| c.max_spill_level)
                .unwrap_or_default();
            warn!(
                pool = self.pool.name(),
                max_spill_level = max_level,
                "exceeded row number spill level limit, abandon spilling"
            );
            self.spill_stats
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .spill_max_level_exceeded_count += 1;
            global_metrics().inc_spill_max_level_exceeded(OPERATOR_NAME);
            return Ok(());
        }
        self.spill()
    }

    fn spill(&mut self) -> Result<()> {
        let Some(config) = self.spill_config.clone() else {
            return Err(StrataError::Internal(
                "row number spill requested with spilling disabled".to_string(),
            ));
        };
        let Some(table) = self.table.as_mut() else {
            return Err(StrataError::Internal(
                "row number spill requested without partition keys".to_string(),
            ));
        };

        let mut table_spiller = HashTableSpiller::new(
            OPERATOR_NAME,
            table.table_schema().clone(),
            table.num_keys(),
            self.restoring_partition.clone(),
            &config,
            self.spill_stats.clone(),
        )?;
        table_spiller.spill(table.to_batches(config.max_spill_run_rows)?)?;
        let spilled = table_spiller.finish_spill(&mut self.hash_table_spill_set)?;
        let key_channels = table.key_channels().to_vec();
        table.clear();
        self.pool.set_used(0)?;
        self.pool.release();
        debug!(
            pool = self.pool.name(),
            restoring = ?self.restoring_partition.as_ref().map(ToString::to_string),
            partitions = spilled.len(),
            "spilled row number table"
        );

        let mut input_spiller = InputSpiller::new(
            OPERATOR_NAME,
            self.input_schema.clone(),
            key_channels,
            self.restoring_partition.clone(),
            &config,
            self.spill_stats.clone(),
        )?;
        if let Some(input) = self.input.take() {
            input_spiller.spill(&input)?;
            self.group_hits.clear();
        }
        self.input_spiller = Some(input_spiller);
        Ok(())
    }

    fn recursive_spill_input(&mut self) -> Result<()> {
        if self.input_spiller.is_none() {
            return Ok(());
        }
        while let Some(reader) = self.spill_input_reader.as_mut() {
            let Some(batch) = reader.next_batch()? else {
                break;
            };
            if let Some(spiller) = self.input_spiller.as_mut() {
                spiller.spill(&batch)?;
            }
            if self.yield_signal.should_yield() {
                self.yield_requested = true;
                return Ok(());
            }
        }
        self.spill_input_reader = None;
        self.finish_spill_input_and_restore_next()
    }

    fn finish_spill_input_and_restore_next(&mut self) -> Result<()> {
        let Some(spiller) = self.input_spiller.take() else {
            return Err(StrataError::Internal(
                "row number has no input spiller to finish".to_string(),
            ));
        };
        spiller.finish_spill(&mut self.input_spill_set)?;
        self.input_spill_set.remove_empty();
        self.restore_next_partition()
    }

    fn restore_next_partition(&mut self) -> Result<()> {
        let Some(partition) = self.input_spill_set.pop_first() else {
            self.restoring_partition = None;
            self.hash_table_spill_set.clear();
            return Ok(());
        };
        let Some(config) = self.spill_config.clone() else {
            return Err(StrataError::Internal(
                "row number restore with spilling disabled".to_string(),
            ));
        };
        let id = partition.id().clone();
        let next_start_bit = id
            .partition_bit_offset(&config)
            .saturating_add(config.num_partition_bits);
        self.exceeded_max_spill_level = config.exceed_spill_level_limit(next_start_bit);
        self.stats.restored_partitions += 1;
        self.stats.max_spill_level = self.stats.max_spill_level.max(id.spill_level());
        debug!(
            pool = self.pool.name(),
            partition = %id,
            rows = partition.num_rows(),
            "restoring spilled row number partition"
        );

        if let Some(table_partition) = self.hash_table_spill_set.remove(&id) {
            let Some(table) = self.table.as_mut() else {
                return Err(StrataError::Internal(
                    "spilled row number table without partition keys".to_string(),
                ));
            };
            let mut reader = table_partition
                .into_reader(config.read_buffer_size, self.spill_stats.clone())
                .with_operator(OPERATOR_NAME);
            while let Some(rows) = reader.next_batch()? {
                table.restore(&rows)?;
            }
            self.pool.set_used(table.memory_bytes())?;
        }
        self.restoring_partition = Some(id.clone());

        let mut reader = partition
            .into_reader(config.read_buffer_size, self.spill_stats.clone())
            .with_operator(OPERATOR_NAME);
        let Some(first) = reader.next_batch()? else {
            return Err(StrataError::Internal(format!(
                "spilled input partition {id} has no rows"
            )));
        };
        self.spill_input_reader = Some(reader);
        self.add_input(first)
    }

    fn single_partition_output(&mut self, input: RecordBatch) -> Result<Option<RecordBatch>> {
        let num_rows = input.num_rows();
        let start = self.num_total_input;
        let num_output = match self.limit {
            Some(limit) => {
                let remaining = (limit - start).max(0) as usize;
                if start + num_rows as i64 >= limit {
                    self.finished_early = true;
                }
                remaining.min(num_rows)
            }
            None => num_rows,
        };
        self.num_total_input += num_rows as i64;
        if num_output == 0 {
            return Ok(None);
        }
        let kept = input.slice(0, num_output);
        let numbers = (0..num_output as i64).map(|i| start + i + 1);
        self.build_output(kept.columns().to_vec(), numbers.collect())
    }

    fn keyed_output(&mut self, input: RecordBatch) -> Result<Option<RecordBatch>> {
        let hits = std::mem::take(&mut self.group_hits);
        let Some(table) = self.table.as_mut() else {
            return Err(StrataError::Internal(
                "keyed row number output without a partition table".to_string(),
            ));
        };
        let mut kept = Vec::with_capacity(hits.len());
        let mut numbers = Vec::with_capacity(hits.len());
        for (row, &group) in hits.iter().enumerate() {
            let count = table.count(group);
            if self.limit.is_some_and(|limit| count >= limit) {
                continue;
            }
            table.set_count(group, count + 1);
            kept.push(row as u32);
            numbers.push(count + 1);
        }
        if kept.is_empty() {
            return Ok(None);
        }
        let columns = if kept.len() == input.num_rows() {
            input.columns().to_vec()
        } else {
            let indices = UInt32Array::from(kept);
            input
                .columns()
                .iter()
                .map(|c| take(c.as_ref(), &indices, None))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| StrataError::Execution(format!("row number take failed: {e}")))?
        };
        self.build_output(columns, numbers)
    }

    fn build_output(
        &self,
        mut columns: Vec<ArrayRef>,
        numbers: Vec<i64>,
    ) -> Result<Option<RecordBatch>> {
        if self.generate_row_number {
            columns.push(Arc::new(Int64Array::from(numbers)));
        }
        RecordBatch::try_new(self.output_schema.clone(), columns)
            .map(Some)
            .map_err(|e| StrataError::Execution(format!("row number output failed: {e}")))
    }
}

impl Operator for RowNumberOperator {
    fn name(&self) -> &str {
        OPERATOR_NAME
    }

    fn output_schema(&self) -> SchemaRef {
        self.output_schema.clone()
    }

    fn needs_input(&self) -> bool {
        !self.no_more_input && !self.finished_early && self.input.is_none()
    }

    fn add_input(&mut self, input: RecordBatch) -> Result<()> {
        if self.table.is_some() {
            self.ensure_input_fits(&input)?;

            if let Some(spiller) = self.input_spiller.as_mut() {
                return spiller.spill(&input);
            }

            let Some(table) = self.table.as_mut() else {
                return Ok(());
            };
            self.group_hits = table.group_probe(&input)?;
            let used = table.memory_bytes();
            self.input = Some(input);
            if let Err(e) = self.pool.set_used(used) {
                if !self.spill_enabled() || self.exceeded_max_spill_level {
                    return Err(e);
                }
                warn!(
                    pool = self.pool.name(),
                    error = %e,
                    "row number table outgrew its reservation, spilling"
                );
                global_metrics().inc_reservation_failures(self.pool.name());
                return self.spill();
            }
            return Ok(());
        }
        self.input = Some(input);
        Ok(())
    }

    fn no_more_input(&mut self) -> Result<()> {
        self.no_more_input = true;
        if self.input_spiller.is_some() {
            self.finish_spill_input_and_restore_next()?;
        }
        Ok(())
    }

    fn get_output(&mut self) -> Result<Option<RecordBatch>> {
        if self.input.is_none() {
            if self.spill_input_reader.is_none() {
                return Ok(None);
            }
            self.recursive_spill_input()?;
            if self.yield_requested {
                self.yield_requested = false;
                return Ok(None);
            }
        }
        let Some(input) = self.input.take() else {
            return Ok(None);
        };

        let output = if self.table.is_some() {
            self.keyed_output(input)?
        } else {
            self.single_partition_output(input)?
        };

        if let Some(reader) = self.spill_input_reader.as_mut() {
            match reader.next_batch()? {
                Some(batch) => self.add_input(batch)?,
                None => {
                    self.spill_input_reader = None;
                    if let Some(table) = self.table.as_mut() {
                        table.clear();
                    }
                    self.pool.set_used(0)?;
                    self.pool.release();
                    self.restore_next_partition()?;
                }
            }
        }
        Ok(output)
    }

    fn is_finished(&self) -> bool {
        self.finished_early
            || (self.no_more_input
                && self.input.is_none()
                && self.spill_input_reader.is_none()
                && self.input_spiller.is_none()
                && self.input_spill_set.is_empty())
    }

    fn pool(&self) -> Option<&Arc<MemoryPool>> {
        Some(&self.pool)
    }

    fn can_reclaim(&self) -> bool {
        self.spill_enabled()
    }

    fn reclaim(&mut self, _target_bytes: usize, stats: &mut ReclaimStats) -> Result<()> {
        let spillable = self.table.as_ref().is_some_and(|t| t.num_distinct() > 0);
        if !spillable || self.exceeded_max_spill_level {
            stats.num_non_reclaimable_attempts += 1;
        }
        let before = self.pool.reserved_bytes();
        self.reclaim_self()?;
        stats.reclaimed_bytes += before.saturating_sub(self.pool.reserved_bytes()) as u64;
        Ok(())
    }
}

impl Drop for RowNumberOperator {
    fn drop(&mut self) {
        self.hash_table_spill_set.clear();
        self.input_spill_set.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Array, Int32Array};
    use arrow_schema::{DataType, Field, Schema};
    use strata_common::{EngineConfig, QueryId, TaskId};

    use super::*;
    use crate::context::TaskContext;
    use crate::driver::YieldPolicy;
    use crate::registry::OperatorRegistry;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int32, true),
            Field::new("v", DataType::Int64, false),
        ]))
    }

    fn batch(keys: Vec<Option<i32>>, values: Vec<i64>) -> RecordBatch {
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int32Array::from(keys)),
                Arc::new(Int64Array::from(values)),
            ],
        )
        .expect("batch")
    }

    fn operator(config: EngineConfig, keys: Vec<usize>, limit: Option<i64>) -> RowNumberOperator {
        let task = TaskContext::new(QueryId(3), TaskId(0), config).expect("task");
        let ctx = DriverContext::new(
            task,
            0,
            Arc::new(OperatorRegistry::with_builtins()),
            YieldPolicy::Never,
        );
        let node = RowNumberNode::new("rn", schema(), keys, limit, true, "row_number")
            .expect("node");
        RowNumberOperator::new(OperatorId(1), &ctx, &node).expect("operator")
    }

    fn numbers(batch: &RecordBatch) -> Vec<i64> {
        let col = batch
            .column(2)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64");
        (0..col.len()).map(|i| col.value(i)).collect()
    }

    #[test]
    fn numbers_rows_per_key_in_arrival_order() {
        let mut op = operator(EngineConfig::default(), vec![0], None);
        op.add_input(batch(vec![Some(1), Some(2), Some(1), None, None], vec![0, 1, 2, 3, 4]))
            .expect("add");
        let out = op.get_output().expect("output").expect("rows");
        assert_eq!(numbers(&out), vec![1, 1, 2, 1, 2]);
        op.add_input(batch(vec![Some(2), Some(1)], vec![5, 6])).expect("add");
        let out = op.get_output().expect("output").expect("rows");
        assert_eq!(numbers(&out), vec![2, 3]);
        op.no_more_input().expect("no more input");
        assert!(op.is_finished());
    }

    #[test]
    fn drops_rows_past_the_partition_limit() {
        let mut op = operator(EngineConfig::default(), vec![0], Some(1));
        op.add_input(batch(vec![Some(1), Some(1), Some(2)], vec![0, 1, 2])).expect("add");
        let out = op.get_output().expect("output").expect("rows");
        assert_eq!(out.num_rows(), 2);
        op.add_input(batch(vec![Some(1), Some(2)], vec![3, 4])).expect("add");
        assert!(op.get_output().expect("output").is_none());
    }

    #[test]
    fn single_partition_finishes_at_limit() {
        let mut op = operator(EngineConfig::default(), Vec::new(), Some(3));
        op.add_input(batch(vec![Some(1), Some(2)], vec![0, 1])).expect("add");
        assert_eq!(numbers(&op.get_output().expect("output").expect("rows")), vec![1, 2]);
        assert!(!op.is_finished());
        op.add_input(batch(vec![Some(1), Some(2)], vec![2, 3])).expect("add");
        assert_eq!(numbers(&op.get_output().expect("output").expect("rows")), vec![3]);
        assert!(op.is_finished());
        assert!(!op.needs_input());
    }

    #[test]
    fn table_outgrowing_budget_without_spill_fails() {
        let mut config = EngineConfig::default();
        config.mem_budget_bytes = 256;
        config.spill.enabled = false;
        let mut op = operator(config, vec![0], None);
        let keys = (0..64).map(Some).collect::<Vec<_>>();
        let err = op
            .add_input(batch(keys, (0..64).collect()))
            .err()
            .expect("resource exhausted");
        assert!(matches!(err, StrataError::ResourceExhausted(_)));
        assert!(err.to_string().contains("usage"));
    }
}
