//! Aggregation specs and the on-device group-by kernel seam.
//!
//! An [`AggregationKernel`] collapses a batch's surviving rows into compacted
//! group buckets in device memory ([`GroupOutput`]). The executor then copies
//! only `count` entries of each output buffer back to the host.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::batch::{Batch, ColumnType};
use crate::device::{
    DeviceAllocation, DeviceId, DeviceRuntime, INDEX_WIDTH, SimulatedDevice, decode_i32,
    decode_i64,
};
use crate::error::{GqxError, GqxResult};

/// Width of one measure accumulator on device.
pub const MEASURE_WIDTH: usize = std::mem::size_of::<i64>();

/// Aggregate function applied per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Count,
    Min,
    Max,
}

impl AggregateFunction {
    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> GqxResult<Self> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(AggregateFunction::Sum),
            "count" => Ok(AggregateFunction::Count),
            "min" => Ok(AggregateFunction::Min),
            "max" => Ok(AggregateFunction::Max),
            _ => Err(GqxError::InvalidArguments(format!(
                "Invalid aggregate function: '{}'. Valid options: sum, count, min, max",
                s
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Count => "count",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }

    /// Accumulator value of an empty group.
    pub fn identity(&self) -> i64 {
        match self {
            AggregateFunction::Sum | AggregateFunction::Count => 0,
            AggregateFunction::Min => i64::MAX,
            AggregateFunction::Max => i64::MIN,
        }
    }

    /// Fold one row value into an accumulator.
    pub fn accumulate(&self, acc: i64, value: i64) -> i64 {
        match self {
            AggregateFunction::Sum => acc.saturating_add(value),
            AggregateFunction::Count => acc.saturating_add(1),
            AggregateFunction::Min => acc.min(value),
            AggregateFunction::Max => acc.max(value),
        }
    }

    /// Combine two partial accumulators of the same group.
    pub fn merge(&self, a: i64, b: i64) -> i64 {
        match self {
            AggregateFunction::Sum | AggregateFunction::Count => a.saturating_add(b),
            AggregateFunction::Min => a.min(b),
            AggregateFunction::Max => a.max(b),
        }
    }
}

/// One output measure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateMeasure {
    /// Output column name
    pub name: String,
    pub function: AggregateFunction,
    /// Input column; `None` only for `Count`
    pub column: Option<String>,
}

impl AggregateMeasure {
    pub fn new(name: impl Into<String>, function: AggregateFunction, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function,
            column: Some(column.into()),
        }
    }

    pub fn count(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function: AggregateFunction::Count,
            column: None,
        }
    }
}

/// GROUP BY one dimension with any number of measures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Int32 dimension column the rows are grouped by
    pub group_by: String,
    pub measures: Vec<AggregateMeasure>,
}

impl AggregateSpec {
    pub fn new(group_by: impl Into<String>, measures: Vec<AggregateMeasure>) -> Self {
        Self {
            group_by: group_by.into(),
            measures,
        }
    }

    pub fn validate(&self) -> GqxResult<()> {
        for m in &self.measures {
            if m.column.is_none() && m.function != AggregateFunction::Count {
                return Err(GqxError::InvalidArguments(format!(
                    "measure '{}' ({}) needs an input column",
                    m.name,
                    m.function.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Columns the kernel reads from device memory, deduplicated.
    pub fn device_columns(&self) -> Vec<&str> {
        let mut cols = vec![self.group_by.as_str()];
        for m in &self.measures {
            if let Some(c) = m.column.as_deref()
                && !cols.contains(&c)
            {
                cols.push(c);
            }
        }
        cols
    }

    pub fn functions(&self) -> Vec<(String, AggregateFunction)> {
        self.measures
            .iter()
            .map(|m| (m.name.clone(), m.function))
            .collect()
    }
}

/// Device buffers a kernel writes its compacted result into.
///
/// Layout: `count` holds one little-endian `i32` with the number of groups
/// `g`; `keys[0..g]` are `i32` group keys; `measures[m][0..g]` are `i64`
/// accumulators. Every buffer is sized for `capacity` groups.
pub struct GroupOutput<R: DeviceRuntime> {
    pub count: DeviceAllocation<R>,
    pub keys: DeviceAllocation<R>,
    pub measures: Vec<DeviceAllocation<R>>,
    capacity: usize,
}

impl<R: DeviceRuntime> GroupOutput<R> {
    pub fn alloc(
        runtime: &Arc<R>,
        device: DeviceId,
        capacity: usize,
        measures: usize,
    ) -> GqxResult<Self> {
        let count = DeviceAllocation::alloc(runtime, INDEX_WIDTH, device)?;
        let keys = DeviceAllocation::alloc(runtime, capacity * INDEX_WIDTH, device)?;
        let measures = (0..measures)
            .map(|_| DeviceAllocation::alloc(runtime, capacity * MEASURE_WIDTH, device))
            .collect::<GqxResult<Vec<_>>>()?;
        Ok(Self {
            count,
            keys,
            measures,
            capacity,
        })
    }

    /// Maximum groups the buffers can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// 디바이스 집계 커널 (외부 협력자)
///
/// `launch` only enqueues work on `stream`; results are visible to the host
/// after the stream is drained.
pub trait AggregationKernel<R: DeviceRuntime>: Send + Sync {
    fn launch(
        &self,
        runtime: &R,
        batch: &Batch<R>,
        spec: &AggregateSpec,
        output: &GroupOutput<R>,
        stream: &R::Stream,
    ) -> GqxResult<()>;
}

/// Group-by kernel for [`SimulatedDevice`]: linear-probing hash table,
/// groups compacted in first-seen order.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostGroupByKernel;

impl AggregationKernel<SimulatedDevice> for HostGroupByKernel {
    fn launch(
        &self,
        runtime: &SimulatedDevice,
        batch: &Batch<SimulatedDevice>,
        spec: &AggregateSpec,
        output: &GroupOutput<SimulatedDevice>,
        stream: &<SimulatedDevice as DeviceRuntime>::Stream,
    ) -> GqxResult<()> {
        let index = batch
            .index_vector()
            .ok_or_else(|| GqxError::InvalidArguments("empty batch has no index vector".into()))?
            .shared();

        let key_col = batch.column(&spec.group_by)?;
        if key_col.column_type() != ColumnType::Int32 {
            return Err(GqxError::TypeMismatch {
                expected: "Int32 group key".to_string(),
                actual: format!("{:?}", key_col.column_type()),
            });
        }
        let keys_in = key_col.buffer().shared();
        let relation_rows = key_col.rows();

        let mut inputs = Vec::with_capacity(spec.measures.len());
        for m in &spec.measures {
            let input = match m.column.as_deref() {
                Some(name) => {
                    let col = batch.column(name)?;
                    Some((col.column_type(), col.buffer().shared()))
                }
                None => None,
            };
            inputs.push((m.function, input));
        }

        let count_out = output.count.buffer().shared();
        let keys_out = output.keys.buffer().shared();
        let measures_out: Vec<_> = output.measures.iter().map(|m| m.buffer().shared()).collect();
        let capacity = output.capacity();

        runtime.enqueue(stream, batch.device(), move || {
            let rows = decode_i32(&index.read());
            let keys = decode_i32(&keys_in.read());
            let values: Vec<Option<Vec<i64>>> = inputs
                .iter()
                .map(|(_, input)| {
                    input.as_ref().map(|(ty, buf)| {
                        let bytes = buf.read();
                        match ty {
                            ColumnType::Int32 => {
                                decode_i32(&bytes).into_iter().map(i64::from).collect()
                            }
                            ColumnType::Int64 => decode_i64(&bytes),
                        }
                    })
                })
                .collect();

            let table_size = (rows.len() * 2).next_power_of_two().max(2);
            let mask = table_size - 1;
            let mut slots: Vec<Option<usize>> = vec![None; table_size];
            let mut group_keys: Vec<i32> = Vec::new();
            let mut accs: Vec<Vec<i64>> = inputs.iter().map(|_| Vec::new()).collect();

            for &row in &rows {
                let r = usize::try_from(row)
                    .ok()
                    .filter(|r| *r < relation_rows)
                    .ok_or_else(|| {
                        GqxError::Gpu(format!("row id {row} outside relation of {relation_rows} rows"))
                    })?;
                let key = keys[r];

                let mut slot = (key as u32).wrapping_mul(0x9E37_79B1) as usize & mask;
                let group = loop {
                    let occupant = slots[slot];
                    match occupant {
                        Some(g) if group_keys[g] == key => break g,
                        Some(_) => slot = (slot + 1) & mask,
                        None => {
                            let g = group_keys.len();
                            slots[slot] = Some(g);
                            group_keys.push(key);
                            for (acc, (func, _)) in accs.iter_mut().zip(&inputs) {
                                acc.push(func.identity());
                            }
                            break g;
                        }
                    }
                };

                for ((acc, (func, _)), vals) in accs.iter_mut().zip(&inputs).zip(&values) {
                    let v = vals.as_ref().map_or(0, |vals| vals[r]);
                    acc[group] = func.accumulate(acc[group], v);
                }
            }

            if group_keys.len() > capacity {
                return Err(GqxError::Gpu(format!(
                    "{} groups exceed output capacity {}",
                    group_keys.len(),
                    capacity
                )));
            }

            let g = group_keys.len();
            count_out.write()[..INDEX_WIDTH].copy_from_slice(&(g as i32).to_le_bytes());
            let mut keys_dst = keys_out.write();
            for (i, k) in group_keys.iter().enumerate() {
                keys_dst[i * INDEX_WIDTH..(i + 1) * INDEX_WIDTH].copy_from_slice(&k.to_le_bytes());
            }
            for (out, acc) in measures_out.iter().zip(&accs) {
                let mut dst = out.write();
                for (i, v) in acc.iter().enumerate() {
                    dst[i * MEASURE_WIDTH..(i + 1) * MEASURE_WIDTH].copy_from_slice(&v.to_le_bytes());
                }
            }
            Ok(())
        })
    }
}
