//! Task and driver contexts handed to operator factories.

use std::sync::Arc;

use strata_common::{EngineConfig, MemoryManager, QueryId, Result, TaskId};

use crate::driver::{YieldPolicy, YieldSignal};
use crate::registry::OperatorRegistry;

/// Per-task execution state shared by every driver of the task.
#[derive(Debug)]
pub struct TaskContext {
    /// Query the task belongs to.
    pub query_id: QueryId,
    /// Task id, used as a metrics label.
    pub task_id: TaskId,
    /// Engine and spill configuration.
    pub config: EngineConfig,
    /// Root memory budget from which operator pools are carved.
    pub memory: Arc<MemoryManager>,
}

/// Shared handle to a [`TaskContext`].
pub type SharedTaskContext = Arc<TaskContext>;

impl TaskContext {
    /// Validate `config` and create a task with a memory budget of `config.mem_budget_bytes`.
    pub fn new(query_id: QueryId, task_id: TaskId, config: EngineConfig) -> Result<SharedTaskContext> {
        config.validate()?;
        let memory = MemoryManager::new(config.mem_budget_bytes);
        Ok(Arc::new(Self {
            query_id,
            task_id,
            config,
            memory,
        }))
    }

    /// Target rows per batch for operators that split their output.
    pub fn batch_size_rows(&self) -> usize {
        self.config.batch_size_rows
    }
}

/// Everything an operator factory needs to build the operators of one driver.
#[derive(Debug)]
pub struct DriverContext {
    /// Owning task.
    pub task: SharedTaskContext,
    /// Index of the driver within its pipeline.
    pub driver_id: u32,
    /// Plan-node to operator translation table.
    pub registry: Arc<OperatorRegistry>,
    /// Cooperative yield signal shared by the driver and its operators.
    pub yield_signal: Arc<YieldSignal>,
}

impl DriverContext {
    /// Driver context using `registry` and the given yield policy.
    pub fn new(
        task: SharedTaskContext,
        driver_id: u32,
        registry: Arc<OperatorRegistry>,
        yield_policy: YieldPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            task,
            driver_id,
            registry,
            yield_signal: Arc::new(YieldSignal::new(yield_policy)),
        })
    }

    /// Name of the memory pool of operator `operator_id`.
    pub fn pool_name(&self, operator: &str, operator_id: u32) -> String {
        format!(
            "{}.{}.{}.{operator}.{operator_id}",
            self.task.query_id, self.task.task_id, self.driver_id
        )
    }
}
