//! Worker-node runtime: binding namespace and request serve loop.
//!
//! A node owns a private namespace of dataset bindings (`name → RecordBatch`)
//! and scalar value bindings (`name → JSON value`). No node ever reads
//! another node's bindings. The runtime processes exactly one request at a
//! time, matching the channel contract on the control side.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shf_common::{NodeId, Result, ShfError, ipc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::eval::{BindingEnv, ExprEvaluator};
use crate::protocol::{self, Request, Response};

/// One worker node's in-process state and serve loop.
pub struct NodeRuntime {
    node: NodeId,
    evaluator: Arc<dyn ExprEvaluator>,
    batches: HashMap<String, RecordBatch>,
    values: HashMap<String, Value>,
    loaded: HashSet<String>,
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("node", &self.node)
            .field("batches", &self.batches.len())
            .field("values", &self.values.len())
            .finish()
    }
}

impl NodeRuntime {
    /// Construct a runtime with an empty namespace.
    pub fn new(node: NodeId, evaluator: Arc<dyn ExprEvaluator>) -> Self {
        Self {
            node,
            evaluator,
            batches: HashMap::new(),
            values: HashMap::new(),
            loaded: HashSet::new(),
        }
    }

    /// Serve requests over an established byte stream until shutdown is
    /// requested or the stream closes.
    pub async fn serve<S>(mut self, stream: S, max_frame_bytes: usize) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed = Framed::new(stream, protocol::frame_codec(max_frame_bytes));
        info!(node = %self.node, operator = "NodeServe", "serving control channel");
        while let Some(frame) = framed.next().await {
            let frame = frame?;
            let (response, shutdown) = match protocol::decode_request(&frame) {
                Ok(request) => {
                    let shutdown = matches!(request, Request::Shutdown);
                    (self.handle(request), shutdown)
                }
                Err(e) => (
                    Response::Error {
                        message: error_message(&e),
                    },
                    false,
                ),
            };
            framed
                .send(Bytes::from(protocol::encode_response(&response)?))
                .await?;
            if shutdown {
                break;
            }
        }
        info!(node = %self.node, operator = "NodeServe", "control channel closed");
        Ok(())
    }

    fn handle(&mut self, request: Request) -> Response {
        match self.try_handle(request) {
            Ok(response) => response,
            Err(e) => Response::Error {
                message: error_message(&e),
            },
        }
    }

    fn try_handle(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::AssignBatch { name, ipc: payload } => {
                let batch = decode_payload(&payload)?;
                let rows = batch.num_rows() as u64;
                debug!(node = %self.node, binding = %name, rows, operator = "NodeAssign", "dataset bound");
                self.batches.insert(name, batch);
                Ok(Response::Bound { rows })
            }
            Request::AssignValue { name, value_json } => {
                let value: Value = serde_json::from_slice(&value_json)
                    .map_err(|e| ShfError::Protocol(format!("value decode failed: {e}")))?;
                debug!(node = %self.node, binding = %name, operator = "NodeAssign", "value bound");
                self.values.insert(name, value);
                Ok(Response::Done)
            }
            Request::Apply { source, target, op } => {
                let input = self.batches.get(&source).cloned().ok_or_else(|| {
                    self.eval_err(format!("unknown binding '{source}'"))
                })?;
                let env = BindingEnv::new(&self.values);
                let out = self.evaluator.evaluate(self.node, Some(&input), &op, &env)?;
                let rows = out.num_rows() as u64;
                debug!(
                    node = %self.node,
                    source = %source,
                    target = %target,
                    rows,
                    operator = "NodeApply",
                    "operation applied"
                );
                self.batches.insert(target, out);
                Ok(Response::Bound { rows })
            }
            Request::Eval { target, op } => {
                let env = BindingEnv::new(&self.values);
                let out = self.evaluator.evaluate(self.node, None, &op, &env)?;
                let rows = out.num_rows() as u64;
                debug!(node = %self.node, target = %target, rows, operator = "NodeEval", "expression bound");
                self.batches.insert(target, out);
                Ok(Response::Bound { rows })
            }
            Request::Describe { name } => {
                let batch = self
                    .batches
                    .get(&name)
                    .ok_or_else(|| self.eval_err(format!("unknown binding '{name}'")))?;
                Ok(Response::Described {
                    rows: batch.num_rows() as u64,
                    schema_ipc: ipc::encode_schema(&batch.schema())?,
                })
            }
            Request::Fetch { name } => {
                let batch = self
                    .batches
                    .get(&name)
                    .ok_or_else(|| self.eval_err(format!("unknown binding '{name}'")))?;
                Ok(Response::Payload {
                    rows: batch.num_rows() as u64,
                    ipc: ipc::encode_batch(batch)?,
                })
            }
            Request::LoadCapability { name } => {
                if !self.loaded.contains(&name) {
                    self.evaluator.load_capability(self.node, &name)?;
                    self.loaded.insert(name.clone());
                    debug!(node = %self.node, capability = %name, operator = "NodeLoad", "capability loaded");
                }
                Ok(Response::Done)
            }
            Request::Shutdown => {
                debug!(node = %self.node, operator = "NodeServe", "shutdown requested");
                Ok(Response::Done)
            }
        }
    }

    fn eval_err(&self, message: String) -> ShfError {
        ShfError::Evaluation {
            node: self.node,
            message,
        }
    }
}

/// Collapse a dataset payload into one batch.
fn decode_payload(payload: &[u8]) -> Result<RecordBatch> {
    let (schema, mut batches) = ipc::decode_stream(payload)?;
    match batches.len() {
        0 => Ok(RecordBatch::new_empty(schema)),
        1 => Ok(batches.pop().expect("one batch")),
        _ => concat_batches(&schema, &batches)
            .map_err(|e| ShfError::Protocol(format!("payload concat failed: {e}"))),
    }
}

/// Strip local taxonomy wrapping so the control side can re-attach node
/// identity without nesting prefixes.
fn error_message(e: &ShfError) -> String {
    match e {
        ShfError::Evaluation { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use shf_common::{ClusterConfig, NodeId, ShfError, ipc};

    use super::NodeRuntime;
    use crate::channel::NodeChannel;
    use crate::eval::{BatchOp, BatchOpEvaluator, CmpOp, Operand};
    use crate::protocol::{OpEnvelope, Request, Response};

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![1_i64, 2, 3, 4]))],
        )
        .expect("batch")
    }

    fn served_channel() -> NodeChannel {
        let config = ClusterConfig::default();
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let runtime = NodeRuntime::new(NodeId(0), Arc::new(BatchOpEvaluator));
        let max = config.max_frame_bytes;
        tokio::spawn(async move {
            let _ = runtime.serve(server, max).await;
        });
        NodeChannel::new(NodeId(0), Box::new(client), &config)
    }

    #[tokio::test]
    async fn assign_apply_fetch_round_trip() {
        let channel = served_channel();
        let batch = sample_batch();

        let resp = channel
            .request(&Request::AssignBatch {
                name: "data".to_string(),
                ipc: ipc::encode_batch(&batch).expect("encode"),
            })
            .await
            .expect("assign");
        assert!(matches!(resp, Response::Bound { rows: 4 }));

        let op = OpEnvelope::from_expr(&BatchOp::Filter {
            column: "v".to_string(),
            cmp: CmpOp::Ge,
            value: Operand::Lit(serde_json::json!(3)),
        })
        .expect("envelope");
        let resp = channel
            .request(&Request::Apply {
                source: "data".to_string(),
                target: "kept".to_string(),
                op,
            })
            .await
            .expect("apply");
        assert!(matches!(resp, Response::Bound { rows: 2 }));

        let resp = channel
            .request(&Request::Fetch {
                name: "kept".to_string(),
            })
            .await
            .expect("fetch");
        let Response::Payload { rows, ipc: payload } = resp else {
            panic!("unexpected response");
        };
        assert_eq!(rows, 2);
        let (_, batches) = ipc::decode_stream(&payload).expect("decode");
        assert_eq!(batches[0].num_rows(), 2);
    }

    #[tokio::test]
    async fn describe_reports_rows_and_schema() {
        let channel = served_channel();
        let batch = sample_batch();
        channel
            .request(&Request::AssignBatch {
                name: "data".to_string(),
                ipc: ipc::encode_batch(&batch).expect("encode"),
            })
            .await
            .expect("assign");

        let resp = channel
            .request(&Request::Describe {
                name: "data".to_string(),
            })
            .await
            .expect("describe");
        let Response::Described { rows, schema_ipc } = resp else {
            panic!("unexpected response");
        };
        assert_eq!(rows, 4);
        let (schema, batches) = ipc::decode_stream(&schema_ipc).expect("decode schema");
        assert_eq!(schema, batch.schema());
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn unknown_binding_is_an_evaluation_error() {
        let channel = served_channel();
        let err = channel
            .request(&Request::Fetch {
                name: "nothing".to_string(),
            })
            .await
            .expect_err("must fail");
        match err {
            ShfError::Evaluation { node, message } => {
                assert_eq!(node, NodeId(0));
                assert!(message.contains("unknown binding 'nothing'"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn shutdown_is_acknowledged_then_channel_closes() {
        let channel = served_channel();
        let resp = channel.request(&Request::Shutdown).await.expect("shutdown");
        assert!(matches!(resp, Response::Done));

        let err = channel
            .request(&Request::Describe {
                name: "data".to_string(),
            })
            .await
            .expect_err("channel must be closed");
        assert!(matches!(err, ShfError::NodeUnavailable { .. }));
    }
}
