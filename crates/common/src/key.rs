//! Grouping-key extraction over record batches.
//!
//! Both the control-side partitioner and the node-side aggregation ops need
//! hashable per-row key values; only key-safe column types are supported.

use arrow::array::{Array, BooleanArray, Int64Array, StringArray};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;

/// One grouping-key component for one row. Nulls form their own group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Int(i64),
    Str(String),
    Bool(bool),
    Null,
}

/// Extract the composite key of every row for the named columns.
///
/// Errors are plain messages so each caller can wrap them in its own error
/// class (partitioning vs. node-side evaluation).
pub fn key_rows(
    batch: &RecordBatch,
    columns: &[String],
) -> std::result::Result<Vec<Vec<KeyValue>>, String> {
    let mut per_column = Vec::with_capacity(columns.len());
    for name in columns {
        let col = batch
            .column_by_name(name)
            .ok_or_else(|| format!("unknown grouping column '{name}'"))?;
        let values: Vec<KeyValue> = match col.data_type() {
            DataType::Int64 => {
                let a = col
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .ok_or_else(|| format!("column '{name}' downcast failed"))?;
                (0..a.len())
                    .map(|i| {
                        if a.is_null(i) {
                            KeyValue::Null
                        } else {
                            KeyValue::Int(a.value(i))
                        }
                    })
                    .collect()
            }
            DataType::Utf8 => {
                let a = col
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| format!("column '{name}' downcast failed"))?;
                (0..a.len())
                    .map(|i| {
                        if a.is_null(i) {
                            KeyValue::Null
                        } else {
                            KeyValue::Str(a.value(i).to_string())
                        }
                    })
                    .collect()
            }
            DataType::Boolean => {
                let a = col
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .ok_or_else(|| format!("column '{name}' downcast failed"))?;
                (0..a.len())
                    .map(|i| {
                        if a.is_null(i) {
                            KeyValue::Null
                        } else {
                            KeyValue::Bool(a.value(i))
                        }
                    })
                    .collect()
            }
            other => {
                return Err(format!(
                    "unsupported grouping key type {other} for column '{name}'"
                ));
            }
        };
        per_column.push(values);
    }

    let rows = batch.num_rows();
    let mut out = Vec::with_capacity(rows);
    for row in 0..rows {
        out.push(per_column.iter().map(|c| c[row].clone()).collect());
    }
    Ok(out)
}
