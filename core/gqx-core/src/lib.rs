//! # GQX: GPU Query Batch Executor
//!
//! GQX는 GPU 쿼리 엔진의 배치 실행 계층입니다. 필터링된 배치 하나를 받아
//! 최종 결과를 누적기(ResultAccumulator)에 추가합니다.
//!
//! ## 주요 특징
//!
//! - **Reduce → Project**: 모든 배치는 두 단계를 순서대로 거칩니다
//! - **Aggregate**: 디바이스에서 그룹화, 압축된 그룹만 호스트로 복사
//! - **NonAggregate**: 인덱스 벡터(행당 4바이트)만 복사, 투영은 호스트에서
//! - **RAII 버퍼**: 호스트/디바이스 버퍼는 모든 경로에서 정확히 한 번 해제
//!
//! ## 빠른 시작
//!
//! ```rust
//! use gqx_core::{
//!     Collaborators, ExecutorConfig, OutputExpr, QueryContext, QuerySpec, RelationSource,
//!     SimulatedDevice,
//! };
//! use arrow::array::Int64Array;
//! use arrow::datatypes::{DataType, Field, Schema};
//! use arrow::record_batch::RecordBatch;
//! use std::sync::Arc;
//!
//! # fn main() -> gqx_core::GqxResult<()> {
//! let schema = Arc::new(Schema::new(vec![Field::new("count", DataType::Int64, false)]));
//! let relation = Arc::new(RecordBatch::try_new(
//!     schema,
//!     vec![Arc::new(Int64Array::from_iter_values((0..10).map(|i| i * 2)))],
//! )?);
//!
//! let runtime = Arc::new(SimulatedDevice::new());
//! let spec = QuerySpec::select(vec![OutputExpr::column("count")]);
//! let mut query = QueryContext::new(
//!     runtime,
//!     &spec,
//!     ExecutorConfig::default(),
//!     Collaborators::simulated(),
//! )?;
//!
//! let mut source = RelationSource::with_rows(relation, vec![5, 9]);
//! query.run(&mut source)?;
//!
//! assert_eq!(query.results().to_json()?, r#"[{"count":10,"row_id":5},{"count":18,"row_id":9}]"#);
//! # Ok(())
//! # }
//! ```
//!
//! ## 아키텍처
//!
//! ```text
//! QueryContext ─▶ BatchSource ─▶ Batch (device) ─▶ QueryExecutor
//!                                                   ├─ AggregateBatchExecutor
//!                                                   └─ NonAggregateBatchExecutor
//!                                                          │
//!                                            DeviceRuntime (sim / cuda)
//! ```

pub mod aggregate;
pub mod batch;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod logging;
pub mod projection;
pub mod query;
pub mod result;
pub mod value;

// ════════════════════════════════════════════
// Public API
// ════════════════════════════════════════════

pub use aggregate::{
    AggregateFunction, AggregateMeasure, AggregateSpec, AggregationKernel, GroupOutput,
    HostGroupByKernel,
};
pub use batch::{Batch, ColumnType, DeviceColumn};
pub use config::ExecutorConfig;
pub use device::{
    DeviceAllocation, DeviceId, DeviceRuntime, Fault, ScopedHostBuffer, SimStats, SimulatedDevice,
};
pub use error::{ErrorKind, GqxError, GqxResult};
pub use executor::{
    AggregateBatchExecutor, BatchContext, BatchExecutor, BatchPhase, ExecutorStats,
    NonAggregateBatchExecutor, QueryExecutor,
};
pub use projection::{ColumnRefEvaluator, OutputExpr, RowEvaluator};
pub use query::{
    BatchSource, Collaborators, QueryContext, QueryFailure, QuerySpec, RelationSource, StreamPool,
};
pub use result::{GroupBucket, ResultAccumulator, ResultRow};
pub use value::ScalarValue;

#[cfg(feature = "gpu")]
pub use device::CudaRuntime;
