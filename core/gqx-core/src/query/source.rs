use arrow::record_batch::RecordBatch;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::batch::Batch;
use crate::device::{DeviceId, DeviceRuntime};
use crate::error::{GqxError, GqxResult};
use crate::query::QuerySpec;

/// Upstream producer of device-resident batches.
pub trait BatchSource<R: DeviceRuntime> {
    /// Next batch of at most `capacity` rows, or `None` when exhausted.
    fn next_batch(
        &mut self,
        runtime: &Arc<R>,
        device: DeviceId,
        capacity: usize,
    ) -> GqxResult<Option<Batch<R>>>;
}

/// Batches over an in-memory relation snapshot.
///
/// Each queued chunk of surviving row ids becomes one batch (split further
/// when it exceeds the capacity). An empty chunk yields an empty batch.
pub struct RelationSource {
    relation: Arc<RecordBatch>,
    chunks: VecDeque<Vec<i32>>,
    device_columns: Vec<String>,
}

impl RelationSource {
    /// Every row of `relation`, in order.
    pub fn full_scan(relation: Arc<RecordBatch>) -> GqxResult<Self> {
        let rows = i32::try_from(relation.num_rows()).map_err(|_| {
            GqxError::InvalidArguments(format!(
                "relation of {} rows exceeds the 32-bit row id range",
                relation.num_rows()
            ))
        })?;
        Ok(Self::with_rows(relation, (0..rows).collect()))
    }

    /// The given surviving row ids, in order.
    pub fn with_rows(relation: Arc<RecordBatch>, rows: Vec<i32>) -> Self {
        Self::from_chunks(relation, vec![rows])
    }

    /// One batch per chunk.
    pub fn from_chunks(relation: Arc<RecordBatch>, chunks: Vec<Vec<i32>>) -> Self {
        Self {
            relation,
            chunks: chunks.into(),
            device_columns: Vec::new(),
        }
    }

    /// Upload the columns `spec` reads on device with every batch.
    pub fn for_query(mut self, spec: &QuerySpec) -> Self {
        self.device_columns = spec
            .device_columns()
            .into_iter()
            .map(str::to_string)
            .collect();
        self
    }

    pub fn with_device_columns(mut self, columns: Vec<String>) -> Self {
        self.device_columns = columns;
        self
    }

    pub fn relation(&self) -> &Arc<RecordBatch> {
        &self.relation
    }

    /// Rows not yet handed out.
    pub fn remaining_rows(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

impl<R: DeviceRuntime> BatchSource<R> for RelationSource {
    fn next_batch(
        &mut self,
        runtime: &Arc<R>,
        device: DeviceId,
        capacity: usize,
    ) -> GqxResult<Option<Batch<R>>> {
        let Some(mut chunk) = self.chunks.pop_front() else {
            return Ok(None);
        };
        if chunk.len() > capacity {
            let rest = chunk.split_off(capacity);
            self.chunks.push_front(rest);
        }

        let columns: Vec<&str> = self.device_columns.iter().map(String::as_str).collect();
        let batch = Batch::upload(
            runtime,
            device,
            Arc::clone(&self.relation),
            &chunk,
            &columns,
            capacity,
        )?;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn relation(rows: i32) -> Arc<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, false)]));
        Arc::new(RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from_iter_values(0..rows))]).unwrap())
    }

    fn sizes(source: &mut RelationSource, capacity: usize) -> Vec<usize> {
        let sim = Arc::new(SimulatedDevice::new());
        let mut sizes = Vec::new();
        while let Some(batch) =
            BatchSource::<SimulatedDevice>::next_batch(source, &sim, DeviceId(0), capacity).unwrap()
        {
            sizes.push(batch.size());
        }
        sizes
    }

    #[test]
    fn full_scan_splits_by_capacity() {
        let mut source = RelationSource::full_scan(relation(10)).unwrap();
        assert_eq!(sizes(&mut source, 4), vec![4, 4, 2]);
        assert_eq!(source.remaining_rows(), 0);
    }

    #[test]
    fn empty_chunk_yields_empty_batch() {
        let mut source = RelationSource::from_chunks(relation(10), vec![vec![1], vec![], vec![2, 3]]);
        assert_eq!(sizes(&mut source, 8), vec![1, 0, 2]);
    }

    #[test]
    fn device_columns_are_uploaded() {
        let sim = Arc::new(SimulatedDevice::new());
        let mut source = RelationSource::with_rows(relation(4), vec![0, 2])
            .with_device_columns(vec!["k".to_string()]);
        let batch = source.next_batch(&sim, DeviceId(0), 8).unwrap().unwrap();
        assert!(batch.column("k").is_ok());
        assert_eq!(sim.stats().device_allocs, 2);
    }
}
