//! Stream-producing execution nodes.

use std::sync::Arc;

use arrow_schema::SchemaRef;
use strata_common::Result;

use crate::context::TaskContext;
use crate::stream::SendableRecordBatchStream;

/// A physical plan fragment that can produce RecordBatches for a task.
///
/// Consumers pull batches from the returned stream; any driver or operator
/// state lives inside the stream.
pub trait ExecNode: Send + Sync {
    /// Node name used in logs.
    fn name(&self) -> &'static str;

    /// Schema of every batch the node produces.
    fn schema(&self) -> SchemaRef;

    /// Start executing the node within `ctx`.
    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream>;
}
