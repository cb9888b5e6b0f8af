//! Query context: drives batches through the per-query executor.
//!
//! The context owns the current batch, the query's stream and the result
//! accumulator. It pulls batches from a [`BatchSource`], hands each one to the
//! executor and stops on exhaustion, cancellation, a satisfied limit, or the
//! first error.

mod source;
mod stream_pool;

pub use source::{BatchSource, RelationSource};
pub use stream_pool::{PooledStream, StreamKey, StreamPool};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::aggregate::{AggregateSpec, AggregationKernel, HostGroupByKernel};
use crate::batch::Batch;
use crate::config::ExecutorConfig;
use crate::device::{DeviceId, DeviceRuntime, SimulatedDevice};
use crate::error::{ErrorKind, GqxError, GqxResult};
use crate::executor::{BatchContext, BatchExecutor, ExecutorStats, QueryExecutor};
use crate::projection::{ColumnRefEvaluator, OutputExpr, RowEvaluator};
use crate::result::ResultAccumulator;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// Shape of a query, as far as batch execution is concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuerySpec {
    Aggregate(AggregateSpec),
    NonAggregate {
        exprs: Vec<OutputExpr>,
        /// Overrides the configured result limit
        limit: Option<usize>,
    },
}

impl QuerySpec {
    pub fn select(exprs: Vec<OutputExpr>) -> Self {
        QuerySpec::NonAggregate { exprs, limit: None }
    }

    pub fn select_limit(exprs: Vec<OutputExpr>, limit: usize) -> Self {
        QuerySpec::NonAggregate {
            exprs,
            limit: Some(limit),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, QuerySpec::Aggregate(_))
    }

    /// Relation columns the executor reads from device memory.
    pub fn device_columns(&self) -> Vec<&str> {
        match self {
            QuerySpec::Aggregate(agg) => agg.device_columns(),
            QuerySpec::NonAggregate { .. } => Vec::new(),
        }
    }
}

/// External collaborators of one query.
pub struct Collaborators<R: DeviceRuntime> {
    pub evaluator: Arc<dyn RowEvaluator>,
    pub kernel: Option<Arc<dyn AggregationKernel<R>>>,
}

impl<R: DeviceRuntime> Collaborators<R> {
    pub fn new(evaluator: Arc<dyn RowEvaluator>) -> Self {
        Self {
            evaluator,
            kernel: None,
        }
    }

    pub fn with_kernel(mut self, kernel: Arc<dyn AggregationKernel<R>>) -> Self {
        self.kernel = Some(kernel);
        self
    }
}

impl Collaborators<SimulatedDevice> {
    /// Column-reference evaluator and the host group-by kernel.
    pub fn simulated() -> Self {
        Self::new(Arc::new(ColumnRefEvaluator)).with_kernel(Arc::new(HostGroupByKernel))
    }
}

/// Record of the error that aborted a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Batches completed before the failure
    pub batches_completed: usize,
}

/// Per-query driver.
pub struct QueryContext<R: DeviceRuntime> {
    query_id: u64,
    runtime: Arc<R>,
    pool: Arc<StreamPool<R>>,
    stream: Arc<PooledStream<R>>,
    device: DeviceId,
    config: ExecutorConfig,
    executor: QueryExecutor<R>,
    current_batch: Option<Batch<R>>,
    results: ResultAccumulator,
    cancelled: Arc<AtomicBool>,
    last_error: Option<QueryFailure>,
    batches: usize,
}

impl<R: DeviceRuntime> QueryContext<R> {
    /// Context with a private stream pool.
    pub fn new(
        runtime: Arc<R>,
        spec: &QuerySpec,
        config: ExecutorConfig,
        collaborators: Collaborators<R>,
    ) -> GqxResult<Self> {
        let pool = Arc::new(StreamPool::new(runtime));
        Self::with_pool(pool, spec, config, collaborators)
    }

    /// Context sharing `pool` with other queries.
    pub fn with_pool(
        pool: Arc<StreamPool<R>>,
        spec: &QuerySpec,
        config: ExecutorConfig,
        collaborators: Collaborators<R>,
    ) -> GqxResult<Self> {
        config.validate()?;
        let executor = QueryExecutor::for_query(
            spec,
            &config,
            collaborators.evaluator,
            collaborators.kernel,
        )?;
        let results = executor.new_accumulator();

        let query_id = NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed);
        let device = DeviceId(config.device);
        let owner = config.dedicated_streams.then_some(query_id);
        let stream = pool.acquire((owner, device))?;

        tracing::debug!(
            target: "executor",
            query_id,
            %device,
            aggregate = executor.is_aggregate(),
            runtime = pool.runtime().name(),
            "query context created"
        );

        Ok(Self {
            query_id,
            runtime: Arc::clone(pool.runtime()),
            pool,
            stream,
            device,
            config,
            executor,
            current_batch: None,
            results,
            cancelled: Arc::new(AtomicBool::new(false)),
            last_error: None,
            batches: 0,
        })
    }

    /// Pull batches from `source` until it is exhausted, the limit is
    /// satisfied, the query is cancelled, or a batch fails.
    pub fn run<S>(&mut self, source: &mut S) -> GqxResult<()>
    where
        S: BatchSource<R> + ?Sized,
    {
        let start = Instant::now();
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return self.fail(GqxError::Cancelled);
            }
            if self.executor.is_satisfied(&self.results) {
                tracing::debug!(target: "executor", query_id = self.query_id, rows = self.results.len(), "result limit reached");
                break;
            }

            // previous batch's device buffers go back before the next upload
            self.current_batch = None;
            let next = source.next_batch(&self.runtime, self.device, self.config.batch_capacity);
            let batch = match next {
                Ok(Some(batch)) => self.current_batch.insert(batch),
                Ok(None) => break,
                Err(e) => return self.fail(e),
            };

            let ctx = BatchContext {
                runtime: &self.runtime,
                batch,
                device: self.device,
                stream: &self.stream,
            };
            if let Err(e) = self.executor.execute_batch(&ctx, &mut self.results) {
                return self.fail(e);
            }
            self.batches += 1;
        }

        self.current_batch = None;
        self.executor.finish();
        tracing::info!(
            target: "executor",
            query_id = self.query_id,
            batches = self.batches,
            rows = self.results.len(),
            elapsed_us = start.elapsed().as_micros(),
            "query finished"
        );
        Ok(())
    }

    fn fail(&mut self, error: GqxError) -> GqxResult<()> {
        self.current_batch = None;
        tracing::warn!(
            target: "executor",
            query_id = self.query_id,
            kind = ?error.kind(),
            batches = self.batches,
            error = %error,
            "query aborted"
        );
        self.last_error = Some(QueryFailure {
            kind: error.kind(),
            message: error.to_string(),
            batches_completed: self.batches,
        });
        Err(error)
    }

    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    /// Batch currently being executed, if any.
    pub fn current_batch(&self) -> Option<&Batch<R>> {
        self.current_batch.as_ref()
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn stream(&self) -> &R::Stream {
        &self.stream
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn executor(&self) -> &QueryExecutor<R> {
        &self.executor
    }

    pub fn stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// Flag that stops the run before the next batch when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn results(&self) -> &ResultAccumulator {
        &self.results
    }

    /// Take the accumulated results, leaving an empty accumulator behind.
    pub fn into_results(mut self) -> ResultAccumulator {
        let empty = self.executor.new_accumulator();
        std::mem::replace(&mut self.results, empty)
    }

    pub fn last_error(&self) -> Option<&QueryFailure> {
        self.last_error.as_ref()
    }
}

impl<R: DeviceRuntime> Drop for QueryContext<R> {
    fn drop(&mut self) {
        self.current_batch = None;
        if self.config.dedicated_streams {
            self.pool.release(self.stream.key());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateFunction, AggregateMeasure};
    use crate::device::Fault;
    use arrow::array::{Int32Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn relation() -> Arc<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("city", DataType::Int32, false),
            Field::new("fare", DataType::Int64, false),
        ]));
        Arc::new(
            RecordBatch::try_new(
                schema,
                vec![
                    Arc::new(Int32Array::from(vec![1, 2, 1, 2, 3, 1, 2, 3])),
                    Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5, 6, 7, 8])),
                ],
            )
            .unwrap(),
        )
    }

    fn select() -> QuerySpec {
        QuerySpec::select(vec![OutputExpr::column("fare")])
    }

    #[test]
    fn runs_all_batches() {
        let sim = Arc::new(SimulatedDevice::new());
        let config = ExecutorConfig::default().with_batch_capacity(3);
        let mut ctx = QueryContext::new(Arc::clone(&sim), &select(), config, Collaborators::simulated()).unwrap();
        let mut source = RelationSource::full_scan(relation()).unwrap();

        ctx.run(&mut source).unwrap();

        assert_eq!(ctx.results().len(), 8);
        assert_eq!(ctx.stats().batches, 3);
        assert!(ctx.current_batch().is_none());
        assert!(ctx.last_error().is_none());
        assert_eq!(sim.stats().live_device_buffers, 0);
        assert_eq!(sim.stats().live_host_buffers, 0);
    }

    #[test]
    fn runs_on_configured_device() {
        let sim = Arc::new(SimulatedDevice::with_devices(2));
        let config = ExecutorConfig::default()
            .with_device(1)
            .with_batch_capacity(4);
        let mut ctx = QueryContext::new(Arc::clone(&sim), &select(), config, Collaborators::simulated()).unwrap();
        assert_eq!(ctx.device(), DeviceId(1));

        let mut source = RelationSource::full_scan(relation()).unwrap();
        ctx.run(&mut source).unwrap();
        assert_eq!(ctx.results().len(), 8);

        // device 2 does not exist on this runtime
        let config = ExecutorConfig::default().with_device(2);
        assert!(QueryContext::new(sim, &select(), config, Collaborators::simulated()).is_err());
    }

    #[test]
    fn stops_pulling_once_limit_is_met() {
        let sim = Arc::new(SimulatedDevice::new());
        let config = ExecutorConfig::default()
            .with_batch_capacity(2)
            .with_result_limit(3);
        let mut ctx = QueryContext::new(sim, &select(), config, Collaborators::simulated()).unwrap();
        let mut source = RelationSource::full_scan(relation()).unwrap();

        ctx.run(&mut source).unwrap();

        assert_eq!(ctx.results().len(), 3);
        assert_eq!(ctx.stats().batches, 2);
        assert_eq!(source.remaining_rows(), 4);
    }

    #[test]
    fn cancelled_query_stops_before_next_batch() {
        let sim = Arc::new(SimulatedDevice::new());
        let mut ctx =
            QueryContext::new(sim, &select(), ExecutorConfig::default(), Collaborators::simulated()).unwrap();
        ctx.cancel_handle().store(true, Ordering::Release);
        let mut source = RelationSource::full_scan(relation()).unwrap();

        let err = ctx.run(&mut source).unwrap_err();
        assert!(matches!(err, GqxError::Cancelled));
        assert!(ctx.results().is_empty());
        assert_eq!(source.remaining_rows(), 8);
    }

    #[test]
    fn failure_keeps_earlier_results() {
        let sim = Arc::new(SimulatedDevice::new());
        let mut ctx = QueryContext::new(
            Arc::clone(&sim),
            &select(),
            ExecutorConfig::default(),
            Collaborators::simulated(),
        )
        .unwrap();
        let mut source = RelationSource::from_chunks(relation(), vec![vec![0, 1], vec![2, 99], vec![3]]);

        let err = ctx.run(&mut source).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Evaluation);
        assert_eq!(ctx.results().len(), 2);
        let failure = ctx.last_error().unwrap();
        assert_eq!(failure.kind, ErrorKind::Evaluation);
        assert_eq!(failure.batches_completed, 1);
        assert_eq!(source.remaining_rows(), 1);
        let stats = sim.stats();
        assert_eq!(stats.live_host_buffers, 0);
        assert_eq!(stats.live_device_buffers, 0);
    }

    #[test]
    fn sync_fault_aborts_run() {
        let sim = Arc::new(SimulatedDevice::new());
        sim.inject_fault(Fault::Sync);
        let mut ctx = QueryContext::new(
            Arc::clone(&sim),
            &select(),
            ExecutorConfig::default(),
            Collaborators::simulated(),
        )
        .unwrap();
        let mut source = RelationSource::full_scan(relation()).unwrap();

        let err = ctx.run(&mut source).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Sync);
        assert!(ctx.results().is_empty());
        assert_eq!(sim.stats().host_allocs, sim.stats().host_frees);
    }

    #[test]
    fn aggregate_merges_groups_across_batches() {
        let sim = Arc::new(SimulatedDevice::new());
        let spec = QuerySpec::Aggregate(AggregateSpec::new(
            "city",
            vec![
                AggregateMeasure::new("total", AggregateFunction::Sum, "fare"),
                AggregateMeasure::count("n"),
            ],
        ));
        let config = ExecutorConfig::default()
            .with_batch_capacity(3)
            .with_result_limit(1);
        let mut ctx = QueryContext::new(sim, &spec, config, Collaborators::simulated()).unwrap();
        let mut source = RelationSource::full_scan(relation()).unwrap().for_query(&spec);

        ctx.run(&mut source).unwrap();

        let results = ctx.into_results();
        let groups: Vec<(i32, i64, i64)> = results
            .groups()
            .iter()
            .map(|g| (g.key, g.measures[0], g.measures[1]))
            .collect();
        assert_eq!(groups, vec![(1, 10, 3), (2, 13, 3), (3, 13, 2)]);
    }

    #[test]
    fn aggregate_needs_kernel() {
        let sim = Arc::new(SimulatedDevice::new());
        let spec = QuerySpec::Aggregate(AggregateSpec::new("city", vec![AggregateMeasure::count("n")]));
        let collab = Collaborators::<SimulatedDevice>::new(Arc::new(ColumnRefEvaluator));
        let err = QueryContext::new(sim, &spec, ExecutorConfig::default(), collab).err().unwrap();
        assert!(matches!(err, GqxError::InvalidArguments(_)));
    }

    #[test]
    fn dedicated_stream_released_on_drop() {
        let sim = Arc::new(SimulatedDevice::new());
        let pool = Arc::new(StreamPool::new(sim));
        let ctx = QueryContext::with_pool(
            Arc::clone(&pool),
            &select(),
            ExecutorConfig::default(),
            Collaborators::simulated(),
        )
        .unwrap();
        assert_eq!(pool.len(), 1);
        drop(ctx);
        assert!(pool.is_empty());
    }

    #[test]
    fn shared_stream_outlives_query() {
        let sim = Arc::new(SimulatedDevice::new());
        let pool = Arc::new(StreamPool::new(sim));
        let mut config = ExecutorConfig::default();
        config.dedicated_streams = false;
        let a = QueryContext::with_pool(Arc::clone(&pool), &select(), config.clone(), Collaborators::simulated())
            .unwrap();
        let b = QueryContext::with_pool(Arc::clone(&pool), &select(), config, Collaborators::simulated())
            .unwrap();
        assert_eq!(a.stream().id(), b.stream().id());
        drop(a);
        drop(b);
        assert_eq!(pool.len(), 1);
    }
}
