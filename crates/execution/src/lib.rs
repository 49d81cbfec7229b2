#![deny(missing_docs)]

//! Execution-layer primitives: the operator contract, the driver, and the
//! stateful operators built on top of them.
//!
//! Architecture role:
//! - task and driver contexts, memory pools per operator
//! - pull-based operators run by a single-threaded driver with cooperative yield
//! - explicit plan-node to operator registry
//! - RowNumber operator with hash-table and input spilling
//!
//! Key modules:
//! - [`context`]
//! - [`operator`]
//! - [`driver`]
//! - [`registry`]
//! - [`row_number`]
//! - [`pipeline`]

pub mod context;
pub mod driver;
pub mod exec_node;
pub mod operator;
pub mod partition_table;
pub mod pipeline;
pub mod plan;
pub mod registry;
pub mod row_number;
pub mod stream;

// Re-export only what you want at the crate root (no globs).
pub use context::{DriverContext, SharedTaskContext, TaskContext};
pub use driver::{Driver, DriverState, YieldPolicy, YieldSignal};
pub use exec_node::ExecNode;
pub use operator::{BlockingReason, Operator, ReclaimStats, ValuesOperator};
pub use pipeline::PipelineExec;
pub use plan::{PlanNode, RowNumberNode, ValuesNode};
pub use registry::{downcast_node, OperatorFactory, OperatorRegistry};
pub use row_number::{RowNumberOperator, RowNumberStats};
pub use stream::{RecordBatchStream, SendableRecordBatchStream, StreamAdapter};
