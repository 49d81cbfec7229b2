//! Single-threaded driver for a linear operator pipeline.
//!
//! The driver moves batches from each operator to the next, propagates
//! end-of-input, serves pending memory reclaim requests between operator
//! calls, and gives up its time slice cooperatively. `run` can be called
//! again after it returns [`DriverState::Yielded`] or
//! [`DriverState::Blocked`]; all progress lives in the operators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arrow::record_batch::RecordBatch;
use strata_common::{global_metrics, OperatorId, Result, StrataError};
use tracing::debug;

use crate::context::DriverContext;
use crate::operator::{BlockingReason, Operator, ReclaimStats};
use crate::plan::PlanNode;

/// When a running driver gives up its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldPolicy {
    /// Run until finished or blocked.
    Never,
    /// Yield once the slice has run for the given time.
    TimeSlice(Duration),
    /// Yield on every n-th yield check. Deterministic; used by tests.
    EveryNChecks(u64),
}

/// Yield decision shared by a driver and the operators it runs.
///
/// Once a check says "yield" the signal stays raised until the driver
/// starts its next slice, so the driver sees a yield an operator asked for.
#[derive(Debug)]
pub struct YieldSignal {
    policy: YieldPolicy,
    slice_start: Mutex<Instant>,
    checks: AtomicU64,
    raised: AtomicBool,
}

impl YieldSignal {
    /// Signal following `policy`.
    pub fn new(policy: YieldPolicy) -> Self {
        Self {
            policy,
            slice_start: Mutex::new(Instant::now()),
            checks: AtomicU64::new(0),
            raised: AtomicBool::new(false),
        }
    }

    /// Start a new time slice.
    pub fn start_slice(&self) {
        *self.slice_start.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.checks.store(0, Ordering::Relaxed);
        self.raised.store(false, Ordering::Release);
    }

    /// True when the current slice is used up.
    pub fn should_yield(&self) -> bool {
        if self.raised.load(Ordering::Acquire) {
            return true;
        }
        let expired = match self.policy {
            YieldPolicy::Never => false,
            YieldPolicy::TimeSlice(slice) => {
                self.slice_start
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .elapsed()
                    >= slice
            }
            YieldPolicy::EveryNChecks(n) => {
                let checks = self.checks.fetch_add(1, Ordering::Relaxed) + 1;
                n > 0 && checks % n == 0
            }
        };
        if expired {
            self.raised.store(true, Ordering::Release);
        }
        expired
    }
}

/// Result of one [`Driver::run`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// The time slice ended; call `run` again to continue.
    Yielded,
    /// An operator is blocked; call `run` again later.
    Blocked(BlockingReason),
    /// The pipeline produced all its output.
    Finished,
}

#[derive(Debug, Default, Clone, Copy)]
struct OperatorCounters {
    rows_in: u64,
    rows_out: u64,
    batches_in: u64,
    batches_out: u64,
    nanos: u64,
    no_more_input_sent: bool,
}

/// Runs a linear pipeline: the first operator is the source, the last one's
/// output is buffered for the caller.
pub struct Driver {
    ctx: Arc<DriverContext>,
    operators: Vec<Box<dyn Operator>>,
    counters: Vec<OperatorCounters>,
    output: VecDeque<RecordBatch>,
    reclaim_stats: ReclaimStats,
    finished: bool,
}

impl Driver {
    /// Driver over already-built operators.
    pub fn new(ctx: Arc<DriverContext>, operators: Vec<Box<dyn Operator>>) -> Result<Self> {
        if operators.is_empty() {
            return Err(StrataError::InvalidConfig(
                "a driver needs at least one operator".to_string(),
            ));
        }
        let counters = vec![OperatorCounters::default(); operators.len()];
        Ok(Self {
            ctx,
            operators,
            counters,
            output: VecDeque::new(),
            reclaim_stats: ReclaimStats::default(),
            finished: false,
        })
    }

    /// Build the operators of `nodes`, source first, with the context's registry.
    pub fn from_plan(ctx: Arc<DriverContext>, nodes: &[Arc<dyn PlanNode>]) -> Result<Self> {
        let operators = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                ctx.registry
                    .create_operator(node.as_ref(), OperatorId(i as u32), &ctx)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(ctx, operators)
    }

    /// Operators of the pipeline, source first.
    pub fn operators(&self) -> &[Box<dyn Operator>] {
        &self.operators
    }

    /// Totals of all reclaim requests served so far.
    pub fn reclaim_stats(&self) -> ReclaimStats {
        self.reclaim_stats
    }

    /// True once `run` returned [`DriverState::Finished`].
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Take the buffered output batches.
    pub fn take_output(&mut self) -> Vec<RecordBatch> {
        self.output.drain(..).collect()
    }

    /// Run until the pipeline finishes, blocks, or the slice ends.
    pub fn run(&mut self) -> Result<DriverState> {
        if self.finished {
            return Ok(DriverState::Finished);
        }
        self.ctx.yield_signal.start_slice();
        loop {
            self.serve_reclaim_requests()?;

            let last = self.operators.len() - 1;
            for i in 0..=last {
                let reason = self.operators[i].is_blocked();
                if reason != BlockingReason::NotBlocked {
                    return Ok(DriverState::Blocked(reason));
                }
                if i < last {
                    self.move_batch(i)?;
                } else {
                    let start = Instant::now();
                    let batch = self.operators[i].get_output()?;
                    self.counters[i].nanos += start.elapsed().as_nanos() as u64;
                    if let Some(batch) = batch {
                        self.counters[i].rows_out += batch.num_rows() as u64;
                        self.counters[i].batches_out += 1;
                        self.output.push_back(batch);
                    }
                    if self.operators[i].is_finished() {
                        self.finish();
                        return Ok(DriverState::Finished);
                    }
                }
            }

            if self.ctx.yield_signal.should_yield() {
                global_metrics().inc_operator_yields(
                    &self.ctx.task.query_id.to_string(),
                    self.ctx.task.task_id.0,
                );
                return Ok(DriverState::Yielded);
            }
        }
    }

    fn move_batch(&mut self, i: usize) -> Result<()> {
        let (head, tail) = self.operators.split_at_mut(i + 1);
        let op = &mut head[i];
        let next = &mut tail[0];
        if !next.needs_input() {
            return Ok(());
        }
        let start = Instant::now();
        match op.get_output()? {
            Some(batch) => {
                let rows = batch.num_rows() as u64;
                self.counters[i].rows_out += rows;
                self.counters[i].batches_out += 1;
                self.counters[i].nanos += start.elapsed().as_nanos() as u64;

                let start = Instant::now();
                next.add_input(batch)?;
                self.counters[i + 1].rows_in += rows;
                self.counters[i + 1].batches_in += 1;
                self.counters[i + 1].nanos += start.elapsed().as_nanos() as u64;
            }
            None => {
                self.counters[i].nanos += start.elapsed().as_nanos() as u64;
                if op.is_finished() && !self.counters[i + 1].no_more_input_sent {
                    self.counters[i + 1].no_more_input_sent = true;
                    next.no_more_input()?;
                }
            }
        }
        Ok(())
    }

    fn serve_reclaim_requests(&mut self) -> Result<()> {
        for op in &mut self.operators {
            let Some(pool) = op.pool().cloned() else {
                continue;
            };
            let Some(target) = pool.take_reclaim_request() else {
                continue;
            };
            if !op.can_reclaim() {
                self.reclaim_stats.num_non_reclaimable_attempts += 1;
                continue;
            }
            let start = Instant::now();
            let before = pool.reserved_bytes();
            let mut stats = ReclaimStats::default();
            op.reclaim(target, &mut stats)?;
            stats.reclaim_exec_time_nanos += start.elapsed().as_nanos() as u64;
            debug!(
                operator = op.name(),
                pool = pool.name(),
                target_bytes = target,
                freed_bytes = before.saturating_sub(pool.reserved_bytes()),
                "served memory reclaim request"
            );
            self.reclaim_stats.reclaimed_bytes += stats.reclaimed_bytes;
            self.reclaim_stats.num_non_reclaimable_attempts += stats.num_non_reclaimable_attempts;
            self.reclaim_stats.reclaim_exec_time_nanos += stats.reclaim_exec_time_nanos;
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
        let query_id = self.ctx.task.query_id.to_string();
        let task_id = self.ctx.task.task_id.0;
        for (op, c) in self.operators.iter().zip(self.counters.iter()) {
            global_metrics().record_operator(
                &query_id,
                task_id,
                op.name(),
                c.rows_in,
                c.rows_out,
                c.batches_in,
                c.batches_out,
                c.nanos as f64 / 1e9,
            );
        }
        debug!(
            query_id = %query_id,
            task_id,
            driver_id = self.ctx.driver_id,
            "driver finished"
        );
    }
}
