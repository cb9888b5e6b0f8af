//! Device-resident row batches.
//!
//! A [`Batch`] is the unit one executor processes: an index vector of row ids
//! that survived upstream filtering/joining, the device copies of the columns
//! aggregation kernels read, and the host-visible relation snapshot those row
//! ids address. Device buffers are returned to the runtime when the batch is
//! dropped, i.e. when the query context advances.

use arrow::array::{Array, AsArray};
use arrow::datatypes::{DataType, Int32Type, Int64Type};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

use crate::device::{DeviceAllocation, DeviceId, DeviceRuntime, INDEX_WIDTH, encode_i32, encode_i64};
use crate::error::{GqxError, GqxResult};

/// Physical type of a device column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int32,
    Int64,
}

impl ColumnType {
    /// Bytes per element.
    pub fn width(&self) -> usize {
        match self {
            ColumnType::Int32 => 4,
            ColumnType::Int64 => 8,
        }
    }

    pub fn from_arrow(dt: &DataType) -> GqxResult<Self> {
        match dt {
            DataType::Int32 => Ok(ColumnType::Int32),
            DataType::Int64 => Ok(ColumnType::Int64),
            other => Err(GqxError::TypeMismatch {
                expected: "Int32|Int64 device column".to_string(),
                actual: format!("{other:?}"),
            }),
        }
    }
}

/// Device copy of one relation column, addressed by row id.
pub struct DeviceColumn<R: DeviceRuntime> {
    name: String,
    column_type: ColumnType,
    rows: usize,
    data: DeviceAllocation<R>,
}

impl<R: DeviceRuntime> DeviceColumn<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn buffer(&self) -> &R::DeviceBuf {
        self.data.buffer()
    }
}

/// One batch of candidate rows.
pub struct Batch<R: DeviceRuntime> {
    size: usize,
    capacity: usize,
    device: DeviceId,
    index_vector: Option<DeviceAllocation<R>>,
    columns: Vec<DeviceColumn<R>>,
    relation: Arc<RecordBatch>,
}

impl<R: DeviceRuntime> Batch<R> {
    /// Batch with no surviving rows. Holds no device memory.
    pub fn empty(relation: Arc<RecordBatch>, capacity: usize, device: DeviceId) -> Self {
        Self {
            size: 0,
            capacity,
            device,
            index_vector: None,
            columns: Vec::new(),
            relation,
        }
    }

    /// Upload `index` and the named relation columns to `device`.
    pub fn upload(
        runtime: &Arc<R>,
        device: DeviceId,
        relation: Arc<RecordBatch>,
        index: &[i32],
        device_columns: &[&str],
        capacity: usize,
    ) -> GqxResult<Self> {
        if index.len() > capacity {
            return Err(GqxError::InvalidArguments(format!(
                "batch of {} rows exceeds capacity {}",
                index.len(),
                capacity
            )));
        }
        if index.is_empty() {
            return Ok(Self::empty(relation, capacity, device));
        }

        let index_vector = DeviceAllocation::upload(runtime, &encode_i32(index), device)?;
        let mut columns = Vec::with_capacity(device_columns.len());
        for name in device_columns {
            columns.push(upload_column(runtime, device, &relation, name)?);
        }

        let bytes = index_vector.len()
            + columns
                .iter()
                .map(|c| c.rows() * c.column_type().width())
                .sum::<usize>();
        tracing::debug!(
            target: "gpu",
            rows = index.len(),
            columns = columns.len(),
            bytes,
            %device,
            "batch uploaded"
        );
        Ok(Self {
            size: index.len(),
            capacity,
            device,
            index_vector: Some(index_vector),
            columns,
            relation,
        })
    }

    /// Valid row count.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Bytes the index vector occupies (`size * INDEX_WIDTH`).
    pub fn index_bytes(&self) -> usize {
        self.size * INDEX_WIDTH
    }

    /// Device index vector; `None` for empty batches.
    pub fn index_vector(&self) -> Option<&R::DeviceBuf> {
        self.index_vector.as_ref().map(|a| a.buffer())
    }

    pub fn column(&self, name: &str) -> GqxResult<&DeviceColumn<R>> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| GqxError::ColumnNotFound(name.to_string()))
    }

    /// Host-visible relation the index vector addresses.
    pub fn relation(&self) -> &Arc<RecordBatch> {
        &self.relation
    }
}

fn upload_column<R: DeviceRuntime>(
    runtime: &Arc<R>,
    device: DeviceId,
    relation: &RecordBatch,
    name: &str,
) -> GqxResult<DeviceColumn<R>> {
    let array = relation
        .column_by_name(name)
        .ok_or_else(|| GqxError::ColumnNotFound(name.to_string()))?;
    let column_type = ColumnType::from_arrow(array.data_type())?;
    let bytes = match column_type {
        ColumnType::Int32 => encode_i32(array.as_primitive::<Int32Type>().values()),
        ColumnType::Int64 => encode_i64(array.as_primitive::<Int64Type>().values()),
    };
    Ok(DeviceColumn {
        name: name.to_string(),
        column_type,
        rows: array.len(),
        data: DeviceAllocation::upload(runtime, &bytes, device)?,
    })
}
