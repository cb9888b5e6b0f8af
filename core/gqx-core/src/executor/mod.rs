//! Batch executors: reduce then project, one batch at a time.
//!
//! ```text
//! UNSTARTED ──reduce()──▶ REDUCED ──project()──▶ PROJECTED ──▶ UNSTARTED (next batch)
//!                                                         └──▶ DONE (pipeline exhausted)
//! ```
//!
//! The variant is fixed per query by [`QueryExecutor::for_query`]; it is never
//! re-evaluated per batch. Failures propagate to the query context and leave
//! the executor ready for the next batch; there is no terminal error state.

mod aggregate;
mod non_aggregate;

pub use aggregate::AggregateBatchExecutor;
pub use non_aggregate::NonAggregateBatchExecutor;

use std::sync::Arc;

use crate::aggregate::AggregationKernel;
use crate::batch::Batch;
use crate::config::ExecutorConfig;
use crate::device::{DeviceId, DeviceRuntime};
use crate::error::{GqxError, GqxResult};
use crate::projection::RowEvaluator;
use crate::query::QuerySpec;
use crate::result::ResultAccumulator;

/// Per-batch lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Unstarted,
    Reduced,
    Projected,
    Done,
}

/// Everything an executor may touch for one batch.
pub struct BatchContext<'a, R: DeviceRuntime> {
    pub runtime: &'a Arc<R>,
    pub batch: &'a Batch<R>,
    pub device: DeviceId,
    pub stream: &'a R::Stream,
}

/// Counters kept by each executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub batches: usize,
    pub empty_batches: usize,
    /// Rows appended (non-aggregate) or buckets produced (aggregate)
    pub rows_emitted: usize,
    pub bytes_device_to_host: usize,
}

/// 배치 실행기 트레이트: reduce → project
pub trait BatchExecutor<R: DeviceRuntime> {
    fn phase(&self) -> BatchPhase;

    /// Device-side phase. May only block through stream operations it issues.
    fn reduce(&mut self, ctx: &BatchContext<'_, R>) -> GqxResult<()>;

    /// Produce the batch's final output and append it to `results`.
    fn project(
        &mut self,
        ctx: &BatchContext<'_, R>,
        results: &mut ResultAccumulator,
    ) -> GqxResult<()>;

    /// Drop any state of a half-processed batch and return to `Unstarted`.
    ///
    /// Work still queued on `ctx.stream` for that state is drained before its
    /// buffers are released.
    fn abandon_batch(&mut self, ctx: &BatchContext<'_, R>);

    /// Move to `Done`; no further batches will be accepted.
    fn finish(&mut self);

    fn stats(&self) -> ExecutorStats;

    /// True when no further batch can change the result.
    fn is_satisfied(&self, _results: &ResultAccumulator) -> bool {
        false
    }

    /// Run one batch through `reduce()` and `project()`.
    fn execute_batch(
        &mut self,
        ctx: &BatchContext<'_, R>,
        results: &mut ResultAccumulator,
    ) -> GqxResult<()> {
        let outcome = self
            .reduce(ctx)
            .and_then(|()| self.project(ctx, results));
        self.abandon_batch(ctx);
        outcome
    }
}

/// Phase bookkeeping shared by both variants.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PhaseTracker {
    phase: BatchPhase,
}

impl PhaseTracker {
    pub(crate) fn new() -> Self {
        Self {
            phase: BatchPhase::Unstarted,
        }
    }

    pub(crate) fn get(&self) -> BatchPhase {
        self.phase
    }

    pub(crate) fn expect(&self, expected: BatchPhase, op: &str) -> GqxResult<()> {
        if self.phase != expected {
            return Err(GqxError::InvalidOperation {
                message: format!("{op}() called in phase {:?}", self.phase),
                context: format!("{op}() requires phase {expected:?}"),
            });
        }
        Ok(())
    }

    pub(crate) fn set(&mut self, phase: BatchPhase) {
        self.phase = phase;
    }

    /// Back to `Unstarted` unless the executor already finished.
    pub(crate) fn reset(&mut self) {
        if self.phase != BatchPhase::Done {
            self.phase = BatchPhase::Unstarted;
        }
    }
}

/// Executor variant chosen once per query.
pub enum QueryExecutor<R: DeviceRuntime> {
    Aggregate(AggregateBatchExecutor<R>),
    NonAggregate(NonAggregateBatchExecutor),
}

impl<R: DeviceRuntime> QueryExecutor<R> {
    /// Pick the variant by query shape.
    pub fn for_query(
        spec: &QuerySpec,
        config: &ExecutorConfig,
        evaluator: Arc<dyn RowEvaluator>,
        kernel: Option<Arc<dyn AggregationKernel<R>>>,
    ) -> GqxResult<Self> {
        match spec {
            QuerySpec::Aggregate(agg) => {
                let kernel = kernel.ok_or_else(|| {
                    GqxError::InvalidArguments(
                        "aggregate query needs an aggregation kernel".to_string(),
                    )
                })?;
                Ok(QueryExecutor::Aggregate(AggregateBatchExecutor::new(
                    agg.clone(),
                    kernel,
                )?))
            }
            QuerySpec::NonAggregate { exprs, limit } => {
                let limit = limit.or(config.result_limit);
                Ok(QueryExecutor::NonAggregate(NonAggregateBatchExecutor::new(
                    exprs.clone(),
                    evaluator,
                    limit,
                )))
            }
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, QueryExecutor::Aggregate(_))
    }

    /// Empty accumulator matching this executor's output layout.
    pub fn new_accumulator(&self) -> ResultAccumulator {
        match self {
            QueryExecutor::Aggregate(e) => e.new_accumulator(),
            QueryExecutor::NonAggregate(e) => e.new_accumulator(),
        }
    }

    fn inner(&self) -> &dyn BatchExecutor<R> {
        match self {
            QueryExecutor::Aggregate(e) => e,
            QueryExecutor::NonAggregate(e) => e,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn BatchExecutor<R> {
        match self {
            QueryExecutor::Aggregate(e) => e,
            QueryExecutor::NonAggregate(e) => e,
        }
    }
}

impl<R: DeviceRuntime> BatchExecutor<R> for QueryExecutor<R> {
    fn phase(&self) -> BatchPhase {
        self.inner().phase()
    }

    fn reduce(&mut self, ctx: &BatchContext<'_, R>) -> GqxResult<()> {
        self.inner_mut().reduce(ctx)
    }

    fn project(
        &mut self,
        ctx: &BatchContext<'_, R>,
        results: &mut ResultAccumulator,
    ) -> GqxResult<()> {
        self.inner_mut().project(ctx, results)
    }

    fn abandon_batch(&mut self, ctx: &BatchContext<'_, R>) {
        self.inner_mut().abandon_batch(ctx)
    }

    fn finish(&mut self) {
        self.inner_mut().finish()
    }

    fn stats(&self) -> ExecutorStats {
        self.inner().stats()
    }

    fn is_satisfied(&self, results: &ResultAccumulator) -> bool {
        self.inner().is_satisfied(results)
    }
}
