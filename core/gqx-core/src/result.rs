//! Result accumulation across batches.
//!
//! Non-aggregate queries append [`ResultRow`]s in projection order; aggregate
//! queries merge [`GroupBucket`]s by key, so the accumulator never holds more
//! buckets than there are distinct groups. The accumulator is rendered once,
//! after the last batch, as an Arrow `RecordBatch` or JSON.

use ahash::AHashMap;
use arrow::array::{ArrayRef, Int32Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use rayon::prelude::*;
use serde::Serialize;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::aggregate::AggregateFunction;
use crate::error::{GqxError, GqxResult};
use crate::value::{ScalarValue, build_column};

/// Column name used for the row identifier of projected rows.
pub const ROW_ID_COLUMN: &str = "row_id";

/// One projected output row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    /// Relation row the values were read from
    pub row_id: i32,
    pub values: SmallVec<[ScalarValue; 4]>,
}

/// One aggregated group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupBucket {
    pub key: i32,
    /// One accumulator per measure, in measure order
    pub measures: SmallVec<[i64; 4]>,
}

#[derive(Debug, Clone, PartialEq)]
enum Layout {
    Rows {
        columns: Vec<String>,
    },
    Groups {
        key: String,
        measures: Vec<(String, AggregateFunction)>,
    },
}

/// Ordered output of one query.
#[derive(Debug, Clone)]
pub struct ResultAccumulator {
    layout: Layout,
    rows: Vec<ResultRow>,
    groups: Vec<GroupBucket>,
    group_slots: AHashMap<i32, usize>,
}

impl ResultAccumulator {
    /// Accumulator for projected rows with the given output column names.
    pub fn for_rows(columns: Vec<String>) -> Self {
        Self::new(Layout::Rows { columns })
    }

    /// Accumulator for group buckets.
    pub fn for_groups(key: impl Into<String>, measures: Vec<(String, AggregateFunction)>) -> Self {
        Self::new(Layout::Groups {
            key: key.into(),
            measures,
        })
    }

    fn new(layout: Layout) -> Self {
        Self {
            layout,
            rows: Vec::new(),
            groups: Vec::new(),
            group_slots: AHashMap::new(),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.layout, Layout::Groups { .. })
    }

    /// Output rows (projected rows or groups) accumulated so far.
    pub fn len(&self) -> usize {
        match self.layout {
            Layout::Rows { .. } => self.rows.len(),
            Layout::Groups { .. } => self.groups.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows that may still be appended under `limit`.
    pub fn remaining(&self, limit: Option<usize>) -> usize {
        match limit {
            Some(limit) => limit.saturating_sub(self.rows.len()),
            None => usize::MAX,
        }
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn groups(&self) -> &[GroupBucket] {
        &self.groups
    }

    /// Append projected rows in order.
    pub fn append_rows(&mut self, rows: Vec<ResultRow>) -> GqxResult<()> {
        let Layout::Rows { columns } = &self.layout else {
            return Err(GqxError::InvalidOperation {
                message: "cannot append projected rows".to_string(),
                context: "accumulator holds group buckets".to_string(),
            });
        };
        if let Some(bad) = rows.iter().find(|r| r.values.len() != columns.len()) {
            return Err(GqxError::InvalidArguments(format!(
                "row {} has {} values, expected {}",
                bad.row_id,
                bad.values.len(),
                columns.len()
            )));
        }
        self.rows.extend(rows);
        Ok(())
    }

    /// Merge buckets into the accumulator by key.
    pub fn merge_groups(&mut self, buckets: Vec<GroupBucket>) -> GqxResult<()> {
        let Layout::Groups { measures, .. } = &self.layout else {
            return Err(GqxError::InvalidOperation {
                message: "cannot merge group buckets".to_string(),
                context: "accumulator holds projected rows".to_string(),
            });
        };

        for bucket in buckets {
            if bucket.measures.len() != measures.len() {
                return Err(GqxError::InvalidArguments(format!(
                    "group {} has {} measures, expected {}",
                    bucket.key,
                    bucket.measures.len(),
                    measures.len()
                )));
            }
            match self.group_slots.get(&bucket.key) {
                Some(&slot) => {
                    let existing = &mut self.groups[slot];
                    for ((acc, value), (_, func)) in existing
                        .measures
                        .iter_mut()
                        .zip(bucket.measures)
                        .zip(measures)
                    {
                        *acc = func.merge(*acc, value);
                    }
                }
                None => {
                    self.group_slots.insert(bucket.key, self.groups.len());
                    self.groups.push(bucket);
                }
            }
        }
        Ok(())
    }

    /// Render as an Arrow RecordBatch.
    pub fn to_record_batch(&self) -> GqxResult<RecordBatch> {
        match &self.layout {
            Layout::Rows { columns } => self.rows_to_record_batch(columns),
            Layout::Groups { key, measures } => self.groups_to_record_batch(key, measures),
        }
    }

    fn rows_to_record_batch(&self, columns: &[String]) -> GqxResult<RecordBatch> {
        let n = self.rows.len();
        let types: Vec<DataType> = (0..columns.len())
            .map(|j| {
                self.rows
                    .iter()
                    .map(|r| r.values[j].data_type())
                    .find(|dt| *dt != DataType::Null)
                    .unwrap_or(DataType::Utf8)
            })
            .collect();

        let mut fields = vec![Field::new(ROW_ID_COLUMN, DataType::Int32, false)];
        fields.extend(
            columns
                .iter()
                .zip(&types)
                .map(|(name, dt)| Field::new(name, dt.clone(), true)),
        );

        let row_ids: ArrayRef = Arc::new(Int32Array::from_iter_values(
            self.rows.iter().map(|r| r.row_id),
        ));
        let value_columns: Vec<ArrayRef> = types
            .par_iter()
            .enumerate()
            .map(|(j, dt)| build_column(self.rows.iter().map(|r| &r.values[j]), dt, n))
            .collect::<GqxResult<_>>()?;

        let mut arrays = Vec::with_capacity(value_columns.len() + 1);
        arrays.push(row_ids);
        arrays.extend(value_columns);
        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }

    fn groups_to_record_batch(
        &self,
        key: &str,
        measures: &[(String, AggregateFunction)],
    ) -> GqxResult<RecordBatch> {
        let mut fields = vec![Field::new(key, DataType::Int32, false)];
        let mut arrays: Vec<ArrayRef> = vec![Arc::new(Int32Array::from_iter_values(
            self.groups.iter().map(|g| g.key),
        ))];
        for (j, (name, _)) in measures.iter().enumerate() {
            fields.push(Field::new(name, DataType::Int64, false));
            arrays.push(Arc::new(Int64Array::from_iter_values(
                self.groups.iter().map(|g| g.measures[j]),
            )));
        }
        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }

    /// Render as an ASCII table, one line per row or group.
    pub fn to_table_string(&self) -> GqxResult<String> {
        let batch = self.to_record_batch()?;
        Ok(arrow::util::pretty::pretty_format_batches(&[batch])?.to_string())
    }

    /// Render as JSON: an array of row objects or group objects.
    pub fn to_json(&self) -> GqxResult<String> {
        let value = match &self.layout {
            Layout::Rows { columns } => serde_json::Value::Array(
                self.rows
                    .iter()
                    .map(|r| -> GqxResult<serde_json::Value> {
                        let mut obj = serde_json::Map::new();
                        obj.insert(ROW_ID_COLUMN.to_string(), r.row_id.into());
                        for (name, v) in columns.iter().zip(&r.values) {
                            obj.insert(name.clone(), serde_json::to_value(v)?);
                        }
                        Ok(serde_json::Value::Object(obj))
                    })
                    .collect::<GqxResult<Vec<_>>>()?,
            ),
            Layout::Groups { key, measures } => serde_json::Value::Array(
                self.groups
                    .iter()
                    .map(|g| {
                        let mut obj = serde_json::Map::new();
                        obj.insert(key.clone(), g.key.into());
                        for ((name, _), v) in measures.iter().zip(&g.measures) {
                            obj.insert(name.clone(), (*v).into());
                        }
                        serde_json::Value::Object(obj)
                    })
                    .collect(),
            ),
        };
        Ok(serde_json::to_string(&value)?)
    }
}
