//! Node-side operation evaluation.
//!
//! [`ExprEvaluator`] is the seam to the expression language: the control
//! plane ships [`OpEnvelope`] payloads it never interprets, and the node
//! resolves them into executable work here. [`BatchOpEvaluator`] is the
//! built-in evaluator for the JSON operation set below; deployments with
//! their own expression language implement the trait instead.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Int64Array, Int64Builder,
    StringArray, StringBuilder,
};
use arrow::compute::filter_record_batch;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shf_common::key::{KeyValue, key_rows};
use shf_common::{NodeId, Result, ShfError};

use crate::protocol::OpEnvelope;

/// Read-only view of a node's private value bindings, resolved during
/// evaluation alongside the operation's captured bindings.
pub struct BindingEnv<'a> {
    values: &'a HashMap<String, Value>,
}

impl<'a> BindingEnv<'a> {
    pub(crate) fn new(values: &'a HashMap<String, Value>) -> Self {
        Self { values }
    }

    /// Look up a node-private value by binding name.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// Evaluation capability of one node.
///
/// Implementations resolve the opaque operation payload into work against
/// the node's current shard. Errors must carry enough context to identify
/// the failure; the runtime attaches the node index.
pub trait ExprEvaluator: Send + Sync {
    /// Evaluate one operation, optionally against an input dataset, and
    /// return the resulting dataset.
    fn evaluate(
        &self,
        node: NodeId,
        input: Option<&RecordBatch>,
        op: &OpEnvelope,
        env: &BindingEnv<'_>,
    ) -> Result<RecordBatch>;

    /// Make a named capability available for later operations.
    ///
    /// The node runtime guarantees at-most-once invocation per name.
    fn load_capability(&self, node: NodeId, name: &str) -> Result<()> {
        let _ = (node, name);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
/// Built-in operation set understood by [`BatchOpEvaluator`].
pub enum BatchOp {
    /// Return the input shard unchanged.
    Identity,
    /// Keep only the named columns, in the given order.
    Select { columns: Vec<String> },
    /// Keep rows where `column cmp value` holds; null rows never match.
    Filter {
        column: String,
        cmp: CmpOp,
        value: Operand,
    },
    /// Summarize the shard as a single-row row count.
    CountRows { alias: String },
    /// Count rows per distinct key combination, one output row per group.
    CountBy { keys: Vec<String>, alias: String },
    /// Materialize a node-private value as a one-row, one-column dataset.
    FromValue { binding: String, column: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
/// Filter operand: a literal, or a variable resolved from the operation's
/// captured bindings first and the node's private values second.
pub enum Operand {
    Var { var: String },
    Lit(Value),
}

#[derive(Debug, Default)]
/// Built-in evaluator for the [`BatchOp`] operation set.
pub struct BatchOpEvaluator;

impl ExprEvaluator for BatchOpEvaluator {
    fn evaluate(
        &self,
        node: NodeId,
        input: Option<&RecordBatch>,
        op: &OpEnvelope,
        env: &BindingEnv<'_>,
    ) -> Result<RecordBatch> {
        let parsed: BatchOp = serde_json::from_slice(&op.expr_json)
            .map_err(|e| eval_err(node, format!("unrecognized operation payload: {e}")))?;
        let mut captured = HashMap::new();
        for (name, value_json) in &op.bindings {
            let value: Value = serde_json::from_slice(value_json).map_err(|e| {
                eval_err(node, format!("captured binding '{name}' decode failed: {e}"))
            })?;
            captured.insert(name.clone(), value);
        }

        match parsed {
            BatchOp::Identity => Ok(require_input(node, input)?.clone()),
            BatchOp::Select { columns } => {
                let batch = require_input(node, input)?;
                let mut indices = Vec::with_capacity(columns.len());
                for name in &columns {
                    let idx = batch
                        .schema()
                        .index_of(name)
                        .map_err(|_| eval_err(node, format!("unknown column '{name}'")))?;
                    indices.push(idx);
                }
                batch
                    .project(&indices)
                    .map_err(|e| eval_err(node, format!("projection failed: {e}")))
            }
            BatchOp::Filter { column, cmp, value } => {
                let batch = require_input(node, input)?;
                let operand = resolve_operand(node, &value, &captured, env)?;
                let mask = filter_mask(node, batch, &column, cmp, &operand)?;
                filter_record_batch(batch, &mask)
                    .map_err(|e| eval_err(node, format!("filter failed: {e}")))
            }
            BatchOp::CountRows { alias } => {
                let batch = require_input(node, input)?;
                let schema = Arc::new(Schema::new(vec![Field::new(&alias, DataType::Int64, false)]));
                let count = Int64Array::from(vec![batch.num_rows() as i64]);
                RecordBatch::try_new(schema, vec![Arc::new(count)])
                    .map_err(|e| eval_err(node, format!("count build failed: {e}")))
            }
            BatchOp::CountBy { keys, alias } => {
                let batch = require_input(node, input)?;
                count_by(node, batch, &keys, &alias)
            }
            BatchOp::FromValue { binding, column } => {
                let value = env
                    .value(&binding)
                    .or_else(|| captured.get(&binding))
                    .ok_or_else(|| {
                        eval_err(node, format!("no value bound at '{binding}' on this node"))
                    })?;
                value_batch(node, &binding, &column, value)
            }
        }
    }
}

fn eval_err(node: NodeId, message: String) -> ShfError {
    ShfError::Evaluation { node, message }
}

fn require_input<'a>(node: NodeId, input: Option<&'a RecordBatch>) -> Result<&'a RecordBatch> {
    input.ok_or_else(|| eval_err(node, "operation requires a dataset input".to_string()))
}

fn resolve_operand(
    node: NodeId,
    operand: &Operand,
    captured: &HashMap<String, Value>,
    env: &BindingEnv<'_>,
) -> Result<Value> {
    match operand {
        Operand::Lit(value) => Ok(value.clone()),
        Operand::Var { var } => captured
            .get(var)
            .or_else(|| env.value(var))
            .cloned()
            .ok_or_else(|| eval_err(node, format!("unbound variable '{var}'"))),
    }
}

fn cmp_holds<T: PartialOrd>(cmp: CmpOp, lhs: T, rhs: T) -> bool {
    match cmp {
        CmpOp::Eq => lhs == rhs,
        CmpOp::Ne => lhs != rhs,
        CmpOp::Lt => lhs < rhs,
        CmpOp::Le => lhs <= rhs,
        CmpOp::Gt => lhs > rhs,
        CmpOp::Ge => lhs >= rhs,
    }
}

fn filter_mask(
    node: NodeId,
    batch: &RecordBatch,
    column: &str,
    cmp: CmpOp,
    operand: &Value,
) -> Result<BooleanArray> {
    let col = batch
        .column_by_name(column)
        .ok_or_else(|| eval_err(node, format!("unknown column '{column}'")))?;
    let mask: Vec<bool> = match col.data_type() {
        DataType::Int64 => {
            let rhs = operand.as_i64().ok_or_else(|| {
                eval_err(node, format!("operand for column '{column}' must be an integer"))
            })?;
            let a = col.as_any().downcast_ref::<Int64Array>().expect("int64 column");
            (0..a.len())
                .map(|i| !a.is_null(i) && cmp_holds(cmp, a.value(i), rhs))
                .collect()
        }
        DataType::Float64 => {
            let rhs = operand.as_f64().ok_or_else(|| {
                eval_err(node, format!("operand for column '{column}' must be a number"))
            })?;
            let a = col
                .as_any()
                .downcast_ref::<Float64Array>()
                .expect("float64 column");
            (0..a.len())
                .map(|i| !a.is_null(i) && cmp_holds(cmp, a.value(i), rhs))
                .collect()
        }
        DataType::Utf8 => {
            let rhs = operand.as_str().ok_or_else(|| {
                eval_err(node, format!("operand for column '{column}' must be a string"))
            })?;
            let a = col
                .as_any()
                .downcast_ref::<StringArray>()
                .expect("utf8 column");
            (0..a.len())
                .map(|i| !a.is_null(i) && cmp_holds(cmp, a.value(i), rhs))
                .collect()
        }
        other => {
            return Err(eval_err(
                node,
                format!("unsupported filter column type {other} for '{column}'"),
            ));
        }
    };
    Ok(BooleanArray::from(mask))
}

fn count_by(node: NodeId, batch: &RecordBatch, keys: &[String], alias: &str) -> Result<RecordBatch> {
    let row_keys = key_rows(batch, keys).map_err(|m| eval_err(node, m))?;
    let mut counts: HashMap<Vec<KeyValue>, i64> = HashMap::new();
    let mut order: Vec<Vec<KeyValue>> = Vec::new();
    for key in row_keys {
        match counts.get_mut(&key) {
            Some(n) => *n += 1,
            None => {
                counts.insert(key.clone(), 1);
                order.push(key);
            }
        }
    }

    let mut fields = Vec::with_capacity(keys.len() + 1);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(keys.len() + 1);
    for (j, name) in keys.iter().enumerate() {
        let source = batch
            .column_by_name(name)
            .ok_or_else(|| eval_err(node, format!("unknown column '{name}'")))?;
        fields.push(Field::new(name, source.data_type().clone(), true));
        let column: ArrayRef = match source.data_type() {
            DataType::Int64 => {
                let mut b = Int64Builder::new();
                for group in &order {
                    match &group[j] {
                        KeyValue::Int(v) => b.append_value(*v),
                        KeyValue::Null => b.append_null(),
                        other => {
                            return Err(eval_err(node, format!("key value mismatch: {other:?}")));
                        }
                    }
                }
                Arc::new(b.finish())
            }
            DataType::Utf8 => {
                let mut b = StringBuilder::new();
                for group in &order {
                    match &group[j] {
                        KeyValue::Str(v) => b.append_value(v),
                        KeyValue::Null => b.append_null(),
                        other => {
                            return Err(eval_err(node, format!("key value mismatch: {other:?}")));
                        }
                    }
                }
                Arc::new(b.finish())
            }
            DataType::Boolean => {
                let mut b = BooleanBuilder::new();
                for group in &order {
                    match &group[j] {
                        KeyValue::Bool(v) => b.append_value(*v),
                        KeyValue::Null => b.append_null(),
                        other => {
                            return Err(eval_err(node, format!("key value mismatch: {other:?}")));
                        }
                    }
                }
                Arc::new(b.finish())
            }
            other => {
                return Err(eval_err(
                    node,
                    format!("unsupported grouping key type {other} for column '{name}'"),
                ));
            }
        };
        columns.push(column);
    }
    fields.push(Field::new(alias, DataType::Int64, false));
    let count_values: Vec<i64> = order.iter().map(|k| counts[k]).collect();
    columns.push(Arc::new(Int64Array::from(count_values)));

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .map_err(|e| eval_err(node, format!("aggregation build failed: {e}")))
}

fn value_batch(node: NodeId, binding: &str, column: &str, value: &Value) -> Result<RecordBatch> {
    let (field, array): (Field, ArrayRef) = match value {
        Value::Number(n) if n.is_i64() => (
            Field::new(column, DataType::Int64, false),
            Arc::new(Int64Array::from(vec![n.as_i64().expect("i64 number")])),
        ),
        Value::Number(n) => (
            Field::new(column, DataType::Float64, false),
            Arc::new(Float64Array::from(vec![n.as_f64().unwrap_or(f64::NAN)])),
        ),
        Value::String(s) => (
            Field::new(column, DataType::Utf8, false),
            Arc::new(StringArray::from(vec![s.clone()])),
        ),
        Value::Bool(b) => (
            Field::new(column, DataType::Boolean, false),
            Arc::new(BooleanArray::from(vec![*b])),
        ),
        other => {
            return Err(eval_err(
                node,
                format!("unsupported value type at '{binding}': {other}"),
            ));
        }
    };
    RecordBatch::try_new(Arc::new(Schema::new(vec![field])), vec![array])
        .map_err(|e| eval_err(node, format!("value materialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use serde_json::json;
    use shf_common::NodeId;

    use super::{BatchOp, BatchOpEvaluator, BindingEnv, CmpOp, ExprEvaluator, Operand};
    use crate::protocol::OpEnvelope;

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("g", DataType::Utf8, false),
            Field::new("v", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["a", "b", "a", "b", "a"])),
                Arc::new(Int64Array::from(vec![1_i64, 2, 3, 4, 5])),
            ],
        )
        .expect("batch")
    }

    fn run(op: BatchOp, input: Option<&RecordBatch>) -> shf_common::Result<RecordBatch> {
        run_with(op, input, |e| e)
    }

    fn run_with(
        op: BatchOp,
        input: Option<&RecordBatch>,
        customize: impl FnOnce(OpEnvelope) -> OpEnvelope,
    ) -> shf_common::Result<RecordBatch> {
        let envelope = customize(OpEnvelope::from_expr(&op).expect("envelope"));
        let values = HashMap::new();
        BatchOpEvaluator.evaluate(NodeId(0), input, &envelope, &BindingEnv::new(&values))
    }

    #[test]
    fn filter_with_literal_operand() {
        let batch = sample_batch();
        let out = run(
            BatchOp::Filter {
                column: "v".to_string(),
                cmp: CmpOp::Gt,
                value: Operand::Lit(json!(3)),
            },
            Some(&batch),
        )
        .expect("filter");
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn filter_with_captured_variable() {
        let batch = sample_batch();
        let out = run_with(
            BatchOp::Filter {
                column: "v".to_string(),
                cmp: CmpOp::Le,
                value: Operand::Var {
                    var: "cutoff".to_string(),
                },
            },
            Some(&batch),
            |envelope| envelope.bind("cutoff", &2_i64).expect("bind"),
        )
        .expect("filter");
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn unknown_column_is_an_evaluation_error() {
        let batch = sample_batch();
        let err = run(
            BatchOp::Select {
                columns: vec!["missing".to_string()],
            },
            Some(&batch),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("unknown column 'missing'"));
    }

    #[test]
    fn count_rows_produces_one_row_summary() {
        let batch = sample_batch();
        let out = run(
            BatchOp::CountRows {
                alias: "n".to_string(),
            },
            Some(&batch),
        )
        .expect("count");
        assert_eq!(out.num_rows(), 1);
        let n = out
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("n");
        assert_eq!(n.value(0), 5);
    }

    #[test]
    fn count_by_groups_in_first_seen_order() {
        let batch = sample_batch();
        let out = run(
            BatchOp::CountBy {
                keys: vec!["g".to_string()],
                alias: "n".to_string(),
            },
            Some(&batch),
        )
        .expect("count_by");
        assert_eq!(out.num_rows(), 2);
        let g = out
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("g");
        let n = out
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("n");
        assert_eq!((g.value(0), n.value(0)), ("a", 3));
        assert_eq!((g.value(1), n.value(1)), ("b", 2));
    }

    #[test]
    fn from_value_reads_node_private_binding() {
        let mut values = HashMap::new();
        values.insert("tag".to_string(), json!("node-3"));
        let envelope = OpEnvelope::from_expr(&BatchOp::FromValue {
            binding: "tag".to_string(),
            column: "t".to_string(),
        })
        .expect("envelope");
        let out = BatchOpEvaluator
            .evaluate(NodeId(0), None, &envelope, &BindingEnv::new(&values))
            .expect("from_value");
        assert_eq!(out.num_rows(), 1);
        let t = out
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("t");
        assert_eq!(t.value(0), "node-3");
    }
}
