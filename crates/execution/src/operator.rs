//! Pull-based operator contract consumed by the [`Driver`](crate::driver::Driver).

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use strata_common::{MemoryPool, Result};

/// Why an operator cannot make progress right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingReason {
    /// The operator can run.
    NotBlocked,
    /// Waiting for memory to be granted by arbitration.
    WaitForMemory,
    /// The operator asked to give up its time slice.
    Yield,
}

/// Outcome of one reclaim request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Bytes returned to the memory manager.
    pub reclaimed_bytes: u64,
    /// Reclaim requests that could not free anything.
    pub num_non_reclaimable_attempts: u64,
    /// Time spent spilling on behalf of the arbitrator.
    pub reclaim_exec_time_nanos: u64,
}

/// A physical operator driven one batch at a time.
///
/// The driver calls `add_input` only while `needs_input` is true, calls
/// `get_output` until it returns `None`, and calls `no_more_input` once the
/// upstream operator is finished. All state needed to resume after a
/// `None` from `get_output` lives in the operator.
pub trait Operator: Send {
    /// Operator type name used in logs and metrics.
    fn name(&self) -> &str;

    /// Schema of every batch returned by `get_output`.
    fn output_schema(&self) -> SchemaRef;

    /// True when the operator can accept another input batch.
    fn needs_input(&self) -> bool;

    /// Hand one input batch to the operator.
    fn add_input(&mut self, input: RecordBatch) -> Result<()>;

    /// Signal that the upstream operator will not produce more batches.
    fn no_more_input(&mut self) -> Result<()>;

    /// Next output batch, or `None` when nothing is ready yet.
    fn get_output(&mut self) -> Result<Option<RecordBatch>>;

    /// Reports whether the driver should stop calling this operator for now.
    fn is_blocked(&self) -> BlockingReason {
        BlockingReason::NotBlocked
    }

    /// True once the operator will never produce output again.
    fn is_finished(&self) -> bool;

    /// Memory pool of the operator, when it tracks memory.
    fn pool(&self) -> Option<&Arc<MemoryPool>> {
        None
    }

    /// True when `reclaim` can free memory by spilling.
    fn can_reclaim(&self) -> bool {
        false
    }

    /// Free memory, typically by spilling, towards `target_bytes`.
    fn reclaim(&mut self, _target_bytes: usize, stats: &mut ReclaimStats) -> Result<()> {
        stats.num_non_reclaimable_attempts += 1;
        Ok(())
    }
}

/// Source operator emitting a fixed list of batches.
#[derive(Debug)]
pub struct ValuesOperator {
    schema: SchemaRef,
    batches: std::collections::VecDeque<RecordBatch>,
}

impl ValuesOperator {
    /// Operator emitting `batches` in order.
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self {
            schema,
            batches: batches.into(),
        }
    }
}

impl Operator for ValuesOperator {
    fn name(&self) -> &str {
        "Values"
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn needs_input(&self) -> bool {
        false
    }

    fn add_input(&mut self, _input: RecordBatch) -> Result<()> {
        Err(strata_common::StrataError::Internal(
            "Values is a source operator and takes no input".to_string(),
        ))
    }

    fn no_more_input(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_output(&mut self) -> Result<Option<RecordBatch>> {
        Ok(self.batches.pop_front())
    }

    fn is_finished(&self) -> bool {
        self.batches.is_empty()
    }
}
