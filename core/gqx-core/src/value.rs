//! Scalar values produced by host-side projection.

use crate::error::{GqxError, GqxResult};
use arrow::array::{
    Array, ArrayRef, AsArray, BooleanBuilder, Float64Builder, Int32Builder, Int64Builder,
    StringBuilder,
};
use arrow::datatypes::{DataType, Float64Type, Int32Type, Int64Type};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single cell value read from a relation column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
}

impl ScalarValue {
    /// Get the Arrow DataType for this value.
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Null => DataType::Null,
            ScalarValue::Int32(_) => DataType::Int32,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::Float64(_) => DataType::Float64,
            ScalarValue::Utf8(_) => DataType::Utf8,
            ScalarValue::Boolean(_) => DataType::Boolean,
        }
    }

    /// Extract a value from an Arrow array at the given index.
    pub fn from_array(array: &ArrayRef, idx: usize) -> GqxResult<Self> {
        if array.is_null(idx) {
            return Ok(ScalarValue::Null);
        }
        match array.data_type() {
            DataType::Int32 => Ok(ScalarValue::Int32(
                array.as_primitive::<Int32Type>().value(idx),
            )),
            DataType::Int64 => Ok(ScalarValue::Int64(
                array.as_primitive::<Int64Type>().value(idx),
            )),
            DataType::Float64 => Ok(ScalarValue::Float64(
                array.as_primitive::<Float64Type>().value(idx),
            )),
            DataType::Boolean => Ok(ScalarValue::Boolean(array.as_boolean().value(idx))),
            DataType::Utf8 => Ok(ScalarValue::Utf8(
                array.as_string::<i32>().value(idx).to_string(),
            )),
            dt => Err(GqxError::TypeMismatch {
                expected: "Int32|Int64|Float64|Boolean|Utf8".to_string(),
                actual: format!("{dt:?}"),
            }),
        }
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int32(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int64(v)
    }
}

/// Build one Arrow column from values that all share `data_type` (or are Null).
pub fn build_column<'a, I>(values: I, data_type: &DataType, len: usize) -> GqxResult<ArrayRef>
where
    I: IntoIterator<Item = &'a ScalarValue>,
{
    macro_rules! build {
        ($builder:expr, $variant:ident, $name:literal) => {{
            let mut builder = $builder;
            for value in values {
                match value {
                    ScalarValue::$variant(v) => builder.append_value(v.clone()),
                    ScalarValue::Null => builder.append_null(),
                    other => {
                        return Err(GqxError::TypeMismatch {
                            expected: $name.to_string(),
                            actual: format!("{other:?}"),
                        });
                    }
                }
            }
            Ok(Arc::new(builder.finish()) as ArrayRef)
        }};
    }

    match data_type {
        DataType::Int32 => build!(Int32Builder::with_capacity(len), Int32, "Int32"),
        DataType::Int64 => build!(Int64Builder::with_capacity(len), Int64, "Int64"),
        DataType::Float64 => build!(Float64Builder::with_capacity(len), Float64, "Float64"),
        DataType::Boolean => build!(BooleanBuilder::with_capacity(len), Boolean, "Boolean"),
        DataType::Utf8 => build!(StringBuilder::with_capacity(len, 256), Utf8, "Utf8"),
        dt => Err(GqxError::TypeMismatch {
            expected: "Int32|Int64|Float64|Boolean|Utf8".to_string(),
            actual: format!("{dt:?}"),
        }),
    }
}
