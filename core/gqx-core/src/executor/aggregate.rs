//! Aggregate path: reduce on device, project only the compacted groups.

use smallvec::SmallVec;
use std::sync::Arc;

use super::{BatchContext, BatchExecutor, BatchPhase, ExecutorStats, PhaseTracker};
use crate::aggregate::{AggregateSpec, AggregationKernel, GroupOutput, MEASURE_WIDTH};
use crate::device::{DeviceRuntime, INDEX_WIDTH, ScopedHostBuffer};
use crate::error::{GqxError, GqxResult};
use crate::result::{GroupBucket, ResultAccumulator};

/// Executor for GROUP BY queries.
///
/// `reduce()` launches the aggregation kernel into freshly allocated group
/// buffers; `project()` reads back the group count, then exactly that many
/// keys and accumulators. No row ids cross the device boundary and the output
/// is never cut by a result limit.
pub struct AggregateBatchExecutor<R: DeviceRuntime> {
    spec: AggregateSpec,
    kernel: Arc<dyn AggregationKernel<R>>,
    phase: PhaseTracker,
    /// Group buffers of the batch between reduce and project
    pending: Option<GroupOutput<R>>,
    stats: ExecutorStats,
}

impl<R: DeviceRuntime> AggregateBatchExecutor<R> {
    pub fn new(spec: AggregateSpec, kernel: Arc<dyn AggregationKernel<R>>) -> GqxResult<Self> {
        spec.validate()?;
        Ok(Self {
            spec,
            kernel,
            phase: PhaseTracker::new(),
            pending: None,
            stats: ExecutorStats::default(),
        })
    }

    pub fn spec(&self) -> &AggregateSpec {
        &self.spec
    }

    pub fn new_accumulator(&self) -> ResultAccumulator {
        ResultAccumulator::for_groups(self.spec.group_by.clone(), self.spec.functions())
    }

    /// Copy the kernel's group count to the host and validate it.
    fn read_group_count(
        &mut self,
        ctx: &BatchContext<'_, R>,
        output: &GroupOutput<R>,
    ) -> GqxResult<usize> {
        let runtime = ctx.runtime.as_ref();
        let mut host = settle(ctx, ScopedHostBuffer::acquire(runtime, INDEX_WIDTH))?;
        settle(ctx, host.fill_from(output.count.buffer(), ctx.stream, ctx.device))?;
        runtime.wait_for_stream(ctx.stream, ctx.device)?;
        self.stats.bytes_device_to_host += INDEX_WIDTH;

        let raw = host.read_i32()?.first().copied().unwrap_or(-1);
        let size = ctx.batch.size();
        match usize::try_from(raw) {
            Ok(count) if count <= size && count <= output.capacity() => Ok(count),
            _ => Err(GqxError::Gpu(format!(
                "aggregation kernel reported {raw} groups for a batch of {size} rows"
            ))),
        }
    }
}

/// Drain `ctx.stream` when `result` is an error, keeping that error.
///
/// Kernels and copies already enqueued still target the batch's buffers, so
/// none of them may be released before the stream is empty.
fn settle<R: DeviceRuntime, T>(ctx: &BatchContext<'_, R>, result: GqxResult<T>) -> GqxResult<T> {
    if result.is_err() {
        drain_quietly(ctx);
    }
    result
}

fn drain_quietly<R: DeviceRuntime>(ctx: &BatchContext<'_, R>) {
    if let Err(e) = ctx.runtime.wait_for_stream(ctx.stream, ctx.device) {
        tracing::warn!(
            target: "executor",
            device = %ctx.device,
            error = %e,
            "drain of abandoned batch failed"
        );
    }
}

impl<R: DeviceRuntime> BatchExecutor<R> for AggregateBatchExecutor<R> {
    fn phase(&self) -> BatchPhase {
        self.phase.get()
    }

    fn reduce(&mut self, ctx: &BatchContext<'_, R>) -> GqxResult<()> {
        self.phase.expect(BatchPhase::Unstarted, "reduce")?;
        let batch = ctx.batch;
        if batch.is_empty() {
            self.phase.set(BatchPhase::Reduced);
            return Ok(());
        }

        let output = GroupOutput::alloc(
            ctx.runtime,
            ctx.device,
            batch.size(),
            self.spec.measures.len(),
        )?;
        self.kernel
            .launch(ctx.runtime.as_ref(), batch, &self.spec, &output, ctx.stream)?;
        tracing::debug!(
            target: "executor",
            rows = batch.size(),
            group_by = %self.spec.group_by,
            "aggregation kernel enqueued"
        );

        self.pending = Some(output);
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
        if ctx.batch.is_empty() {
            self.stats.empty_batches += 1;
            self.phase.set(BatchPhase::Projected);
            return Ok(());
        }

        // Dropped on every exit path below, returning the group buffers. Paths
        // that leave work queued drain the stream first.
        let output = self.pending.take().ok_or_else(|| GqxError::InvalidOperation {
            message: "no reduced groups for this batch".to_string(),
            context: "AggregateBatchExecutor::project".to_string(),
        })?;
        let start = std::time::Instant::now();

        let groups = self.read_group_count(ctx, &output)?;
        if groups == 0 {
            self.phase.set(BatchPhase::Projected);
            return Ok(());
        }

        let runtime = ctx.runtime.as_ref();
        let key_bytes = groups * INDEX_WIDTH;
        let measure_bytes = groups * MEASURE_WIDTH;

        let mut keys_host = ScopedHostBuffer::acquire(runtime, key_bytes)?;
        let mut measure_hosts = Vec::with_capacity(output.measures.len());
        for _ in &output.measures {
            measure_hosts.push(ScopedHostBuffer::acquire(runtime, measure_bytes)?);
        }

        settle(ctx, keys_host.fill_from(output.keys.buffer(), ctx.stream, ctx.device))?;
        for (host, dev) in measure_hosts.iter_mut().zip(&output.measures) {
            settle(ctx, host.fill_from(dev.buffer(), ctx.stream, ctx.device))?;
        }
        runtime.wait_for_stream(ctx.stream, ctx.device)?;
        self.stats.bytes_device_to_host += key_bytes + measure_bytes * measure_hosts.len();

        let keys = keys_host.read_i32()?;
        let columns = measure_hosts
            .iter()
            .map(|h| h.read_i64())
            .collect::<GqxResult<Vec<_>>>()?;

        let buckets: Vec<GroupBucket> = keys
            .iter()
            .enumerate()
            .map(|(i, &key)| GroupBucket {
                key,
                measures: columns.iter().map(|c| c[i]).collect::<SmallVec<_>>(),
            })
            .collect();

        results.merge_groups(buckets)?;
        self.stats.rows_emitted += groups;
        self.phase.set(BatchPhase::Projected);

        tracing::debug!(
            target: "executor",
            rows = ctx.batch.size(),
            groups,
            total_groups = results.len(),
            elapsed_us = start.elapsed().as_micros(),
            "aggregate batch projected"
        );
        Ok(())
    }

    fn abandon_batch(&mut self, ctx: &BatchContext<'_, R>) {
        if self.pending.is_some() {
            // reduced but never projected: the kernel may still be queued
            drain_quietly(ctx);
            self.pending = None;
        }
        self.phase.reset();
    }

    fn finish(&mut self) {
        self.pending = None;
        self.phase.set(BatchPhase::Done);
    }

    fn stats(&self) -> ExecutorStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateFunction, AggregateMeasure, HostGroupByKernel};
    use crate::batch::Batch;
    use crate::device::{DeviceId, Fault, SimulatedDevice};
    use arrow::array::{Int32Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    const D0: DeviceId = DeviceId(0);

    fn relation() -> Arc<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("city", DataType::Int32, false),
            Field::new("fare", DataType::Int64, false),
        ]));
        Arc::new(
            RecordBatch::try_new(
                schema,
                vec![
                    Arc::new(Int32Array::from(vec![1, 2, 1, 3, 2, 1])),
                    Arc::new(Int64Array::from(vec![10, 20, 30, 40, 50, 60])),
                ],
            )
            .unwrap(),
        )
    }

    fn spec() -> AggregateSpec {
        AggregateSpec::new(
            "city",
            vec![
                AggregateMeasure::new("total", AggregateFunction::Sum, "fare"),
                AggregateMeasure::count("trips"),
                AggregateMeasure::new("low", AggregateFunction::Min, "fare"),
            ],
        )
    }

    fn executor() -> AggregateBatchExecutor<SimulatedDevice> {
        AggregateBatchExecutor::new(spec(), Arc::new(HostGroupByKernel)).unwrap()
    }

    fn batch(sim: &Arc<SimulatedDevice>, index: &[i32]) -> Batch<SimulatedDevice> {
        Batch::upload(sim, D0, relation(), index, &["city", "fare"], 16).unwrap()
    }

    #[test]
    fn groups_rows_on_device() {
        let sim = Arc::new(SimulatedDevice::new());
        let stream = sim.create_stream(D0).unwrap();
        let batch = batch(&sim, &[0, 1, 2, 4, 5]);
        let ctx = BatchContext {
            runtime: &sim,
            batch: &batch,
            device: D0,
            stream: &stream,
        };
        let mut exec = executor();
        let mut results = exec.new_accumulator();

        exec.execute_batch(&ctx, &mut results).unwrap();

        let groups = results.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, 1);
        assert_eq!(groups[0].measures.as_slice(), &[100, 3, 10]);
        assert_eq!(groups[1].key, 2);
        assert_eq!(groups[1].measures.as_slice(), &[70, 2, 20]);
        assert_eq!(exec.phase(), BatchPhase::Unstarted);
    }

    #[test]
    fn reduce_does_not_drain() {
        let sim = Arc::new(SimulatedDevice::new());
        let stream = sim.create_stream(D0).unwrap();
        let batch = batch(&sim, &[0, 1]);
        let ctx = BatchContext {
            runtime: &sim,
            batch: &batch,
            device: D0,
            stream: &stream,
        };
        let mut exec = executor();
        exec.reduce(&ctx).unwrap();
        assert_eq!(sim.stats().drains, 0);
        assert_eq!(stream.pending(), 1);
        assert_eq!(exec.phase(), BatchPhase::Reduced);
    }

    #[test]
    fn abandon_after_reduce_drains_stream() {
        let sim = Arc::new(SimulatedDevice::new());
        let stream = sim.create_stream(D0).unwrap();
        let batch = batch(&sim, &[0, 1, 3]);
        let ctx = BatchContext {
            runtime: &sim,
            batch: &batch,
            device: D0,
            stream: &stream,
        };
        let mut exec = executor();
        exec.reduce(&ctx).unwrap();
        exec.abandon_batch(&ctx);

        assert_eq!(stream.pending(), 0);
        assert_eq!(sim.stats().drains, 1);
        // index vector and the two key/measure columns
        assert_eq!(sim.stats().live_device_buffers, 3);
        assert_eq!(exec.phase(), BatchPhase::Unstarted);
    }

    #[test]
    fn project_before_reduce_is_rejected() {
        let sim = Arc::new(SimulatedDevice::new());
        let stream = sim.create_stream(D0).unwrap();
        let batch = batch(&sim, &[0]);
        let ctx = BatchContext {
            runtime: &sim,
            batch: &batch,
            device: D0,
            stream: &stream,
        };
        let mut exec = executor();
        let mut results = exec.new_accumulator();
        let err = exec.project(&ctx, &mut results).unwrap_err();
        assert!(matches!(err, GqxError::InvalidOperation { .. }));
    }

    #[test]
    fn failed_project_releases_everything() {
        let sim = Arc::new(SimulatedDevice::new());
        let stream = sim.create_stream(D0).unwrap();
        let batch = batch(&sim, &[0, 1, 2]);
        let ctx = BatchContext {
            runtime: &sim,
            batch: &batch,
            device: D0,
            stream: &stream,
        };
        let mut exec = executor();
        let mut results = exec.new_accumulator();
        sim.inject_fault(Fault::Sync);

        let err = exec.execute_batch(&ctx, &mut results).unwrap_err();
        assert!(matches!(err, GqxError::SyncFailure { .. }));
        assert!(results.is_empty());

        let stats = sim.stats();
        assert_eq!(stats.host_allocs, stats.host_frees);
        // only the batch's index vector and two columns remain
        assert_eq!(stats.live_device_buffers, 3);
        assert_eq!(exec.phase(), BatchPhase::Unstarted);
    }

    #[test]
    fn out_of_range_row_fails_in_kernel() {
        let sim = Arc::new(SimulatedDevice::new());
        let stream = sim.create_stream(D0).unwrap();
        let batch = batch(&sim, &[0, 99]);
        let ctx = BatchContext {
            runtime: &sim,
            batch: &batch,
            device: D0,
            stream: &stream,
        };
        let mut exec = executor();
        let mut results = exec.new_accumulator();
        let err = exec.execute_batch(&ctx, &mut results).unwrap_err();
        assert!(matches!(err, GqxError::SyncFailure { .. }));
        assert!(results.is_empty());
    }
}
