//! [`ExecNode`] running a linear plan on a [`Driver`].

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::stream;
use strata_common::{Result, StrataError};
use tracing::debug;

use crate::context::{DriverContext, TaskContext};
use crate::driver::{Driver, DriverState, YieldPolicy};
use crate::exec_node::ExecNode;
use crate::plan::PlanNode;
use crate::registry::OperatorRegistry;
use crate::stream::{SendableRecordBatchStream, StreamAdapter};

/// Runs `nodes` (source first) as one driver and streams the last node's output.
pub struct PipelineExec {
    nodes: Vec<Arc<dyn PlanNode>>,
    registry: Arc<OperatorRegistry>,
    yield_policy: YieldPolicy,
}

impl PipelineExec {
    /// Pipeline over `nodes`, translated with `registry`.
    pub fn try_new(nodes: Vec<Arc<dyn PlanNode>>, registry: Arc<OperatorRegistry>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(StrataError::InvalidConfig(
                "a pipeline needs at least one plan node".to_string(),
            ));
        }
        Ok(Self {
            nodes,
            registry,
            yield_policy: YieldPolicy::Never,
        })
    }

    /// Yield policy of the driver; a yield hands the batches produced so far to the stream.
    pub fn with_yield_policy(mut self, policy: YieldPolicy) -> Self {
        self.yield_policy = policy;
        self
    }
}

struct PipelineState {
    driver: Driver,
    pending: VecDeque<RecordBatch>,
    done: bool,
}

impl PipelineState {
    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            if let Some(batch) = self.pending.pop_front() {
                return Ok(Some(batch));
            }
            if self.done {
                return Ok(None);
            }
            let state = self.driver.run()?;
            self.pending.extend(self.driver.take_output());
            match state {
                DriverState::Finished => self.done = true,
                DriverState::Yielded => {}
                DriverState::Blocked(reason) => {
                    debug!(?reason, "pipeline driver blocked, retrying");
                    std::thread::yield_now();
                }
            }
        }
    }
}

impl ExecNode for PipelineExec {
    fn name(&self) -> &'static str {
        "PipelineExec"
    }

    fn schema(&self) -> SchemaRef {
        match self.nodes.last() {
            Some(node) => node.output_schema(),
            None => Arc::new(arrow_schema::Schema::empty()),
        }
    }

    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let driver_ctx = DriverContext::new(ctx, 0, self.registry.clone(), self.yield_policy);
        let driver = Driver::from_plan(driver_ctx, &self.nodes)?;
        let state = PipelineState {
            driver,
            pending: VecDeque::new(),
            done: false,
        };
        let inner = stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            match state.next_batch() {
                Ok(Some(batch)) => Some((Ok(batch), Some(state))),
                Ok(None) => None,
                // Ends the stream after the error.
                Err(e) => Some((Err(e), None)),
            }
        });
        Ok(Box::pin(StreamAdapter::new(self.schema(), Box::pin(inner))))
    }
}
