//! Non-aggregate path: move row ids to the host and project there.
//!
//! Output is bounded by the result limit, so only the index vector (4 bytes
//! per row) is copied off the device; column values are read host-side for
//! the rows that actually make it into the result.

use smallvec::SmallVec;
use std::sync::Arc;

use super::{BatchContext, BatchExecutor, BatchPhase, ExecutorStats, PhaseTracker};
use crate::device::{DeviceRuntime, ScopedHostBuffer};
use crate::error::{GqxError, GqxResult};
use crate::projection::{OutputExpr, RowEvaluator};
use crate::result::{ResultAccumulator, ResultRow};

/// Executor for plain SELECT queries.
pub struct NonAggregateBatchExecutor {
    exprs: Vec<OutputExpr>,
    evaluator: Arc<dyn RowEvaluator>,
    /// Overall result limit across all batches
    limit: Option<usize>,
    phase: PhaseTracker,
    stats: ExecutorStats,
}

impl NonAggregateBatchExecutor {
    pub fn new(
        exprs: Vec<OutputExpr>,
        evaluator: Arc<dyn RowEvaluator>,
        limit: Option<usize>,
    ) -> Self {
        Self {
            exprs,
            evaluator,
            limit,
            phase: PhaseTracker::new(),
            stats: ExecutorStats::default(),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn new_accumulator(&self) -> ResultAccumulator {
        ResultAccumulator::for_rows(
            self.exprs
                .iter()
                .map(|e| e.output_name().to_string())
                .collect(),
        )
    }
}

impl<R: DeviceRuntime> BatchExecutor<R> for NonAggregateBatchExecutor {
    fn phase(&self) -> BatchPhase {
        self.phase.get()
    }

    fn reduce(&mut self, _ctx: &BatchContext<'_, R>) -> GqxResult<()> {
        // nothing to group
        self.phase.expect(BatchPhase::Unstarted, "reduce")?;
        self.phase.set(BatchPhase::Reduced);
        Ok(())
    }

    fn project(
        &mut self,
        ctx: &BatchContext<'_, R>,
        results: &mut ResultAccumulator,
    ) -> GqxResult<()> {
        self.phase.expect(BatchPhase::Reduced, "project")?;
        self.stats.batches += 1;
        let batch = ctx.batch;
        if batch.is_empty() {
            self.stats.empty_batches += 1;
            self.phase.set(BatchPhase::Projected);
            return Ok(());
        }

        let index = batch.index_vector().ok_or_else(|| GqxError::InvalidOperation {
            message: format!("batch of {} rows has no index vector", batch.size()),
            context: "NonAggregateBatchExecutor::project".to_string(),
        })?;
        let runtime = ctx.runtime.as_ref();
        let start = std::time::Instant::now();

        // Released when this scope ends, on success and on every `?` below.
        let mut host = ScopedHostBuffer::acquire(runtime, batch.index_bytes())?;
        host.fill_from(index, ctx.stream, ctx.device)?;
        runtime.wait_for_stream(ctx.stream, ctx.device)?;
        self.stats.bytes_device_to_host += host.len();
        let row_ids = host.read_i32()?;

        let relation = batch.relation();
        let take = results.remaining(self.limit).min(row_ids.len());
        let mut staged = Vec::with_capacity(take);
        for &row_id in &row_ids[..take] {
            let row = usize::try_from(row_id)
                .ok()
                .filter(|r| *r < relation.num_rows())
                .ok_or_else(|| {
                    GqxError::eval(
                        row_id,
                        format!("row id outside relation of {} rows", relation.num_rows()),
                    )
                })?;
            let values = self
                .exprs
                .iter()
                .map(|expr| self.evaluator.evaluate(expr, relation, row))
                .collect::<GqxResult<SmallVec<_>>>()?;
            staged.push(ResultRow { row_id, values });
        }

        results.append_rows(staged)?;
        self.stats.rows_emitted += take;
        self.phase.set(BatchPhase::Projected);

        tracing::debug!(
            target: "executor",
            rows = batch.size(),
            emitted = take,
            bytes = batch.index_bytes(),
            elapsed_us = start.elapsed().as_micros(),
            "non-aggregate batch projected"
        );
        Ok(())
    }

    fn abandon_batch(&mut self, _ctx: &BatchContext<'_, R>) {
        self.phase.reset();
    }

    fn finish(&mut self) {
        self.phase.set(BatchPhase::Done);
    }

    fn stats(&self) -> ExecutorStats {
        self.stats
    }

    fn is_satisfied(&self, results: &ResultAccumulator) -> bool {
        results.remaining(self.limit) == 0
    }
}
