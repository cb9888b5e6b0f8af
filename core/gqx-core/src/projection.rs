//! Output expressions and the host-side row evaluator seam.
//!
//! The executor only decides *which* rows are evaluated and in what order.
//! What an expression means is up to the [`RowEvaluator`] the query supplies.

use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::error::{GqxError, GqxResult};
use crate::value::ScalarValue;

/// One selected output column of a non-aggregate query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputExpr {
    /// Raw value of a relation column
    Column(String),
    /// Expression owned by an external evaluator, identified by its text
    Opaque { alias: String, expr: String },
}

impl OutputExpr {
    pub fn column(name: impl Into<String>) -> Self {
        OutputExpr::Column(name.into())
    }

    /// Name of the produced output column.
    pub fn output_name(&self) -> &str {
        match self {
            OutputExpr::Column(name) => name,
            OutputExpr::Opaque { alias, .. } => alias,
        }
    }
}

/// 행 단위 표현식 평가기 (외부 협력자)
pub trait RowEvaluator: Send + Sync {
    /// Evaluate `expr` for relation row `row`. `row` is already bounds-checked.
    fn evaluate(&self, expr: &OutputExpr, relation: &RecordBatch, row: usize)
    -> GqxResult<ScalarValue>;
}

/// Evaluator that resolves plain column references and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct ColumnRefEvaluator;

impl RowEvaluator for ColumnRefEvaluator {
    fn evaluate(
        &self,
        expr: &OutputExpr,
        relation: &RecordBatch,
        row: usize,
    ) -> GqxResult<ScalarValue> {
        match expr {
            OutputExpr::Column(name) => {
                let column = relation
                    .column_by_name(name)
                    .ok_or_else(|| GqxError::ColumnNotFound(name.clone()))?;
                ScalarValue::from_array(column, row)
            }
            OutputExpr::Opaque { expr, .. } => Err(GqxError::eval(
                row as i64,
                format!("no evaluator registered for expression '{expr}'"),
            )),
        }
    }
}
