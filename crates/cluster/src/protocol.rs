//! Wire protocol between the control process and one node.
//!
//! Transport framing is length-delimited; each frame carries one
//! bincode-encoded [`Request`] or [`Response`] envelope. Dataset payloads
//! inside messages are Arrow IPC streams; operation expressions and captured
//! bindings are opaque JSON bytes the control plane never interprets.
//!
//! Contract notes:
//! - strictly request/response, one outstanding request per node;
//! - a node answers every request, including failures ([`Response::Error`]);
//! - [`Request::Shutdown`] is acknowledged before the node closes its side.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use shf_common::{NodeId, Result, ShfError};
use tokio_util::codec::LengthDelimitedCodec;

/// Wire protocol version; bumped on any incompatible message change.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One transformation operation: an opaque expression payload plus the
/// captured variable bindings it closes over.
///
/// Captured bindings are shipped with every call and never cached across
/// calls. Only the node-side evaluator interprets either field.
pub struct OpEnvelope {
    /// JSON-encoded expression payload.
    pub expr_json: Vec<u8>,
    /// JSON-encoded captured values, keyed by free-variable name.
    pub bindings: Vec<(String, Vec<u8>)>,
}

impl OpEnvelope {
    /// Build an envelope from any serializable expression value.
    pub fn from_expr<E: Serialize>(expr: &E) -> Result<Self> {
        let expr_json = serde_json::to_vec(expr)
            .map_err(|e| ShfError::Protocol(format!("operation encode failed: {e}")))?;
        Ok(Self {
            expr_json,
            bindings: Vec::new(),
        })
    }

    /// Capture one variable binding to ship with the operation.
    pub fn bind<V: Serialize>(mut self, name: impl Into<String>, value: &V) -> Result<Self> {
        let value_json = serde_json::to_vec(value)
            .map_err(|e| ShfError::Protocol(format!("binding encode failed: {e}")))?;
        self.bindings.push((name.into(), value_json));
        Ok(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Control-process → node messages.
pub enum Request {
    /// Bind a serialized dataset under `name` in the node's namespace.
    AssignBatch {
        name: String,
        /// Arrow IPC stream payload.
        ipc: Vec<u8>,
    },
    /// Bind a private scalar value (JSON bytes) under `name`.
    AssignValue { name: String, value_json: Vec<u8> },
    /// Evaluate `op` against the dataset bound at `source` and rebind the
    /// result at `target`.
    Apply {
        source: String,
        target: String,
        op: OpEnvelope,
    },
    /// Evaluate `op` with no input dataset and bind the result at `target`.
    Eval { target: String, op: OpEnvelope },
    /// Report row count and schema for the dataset bound at `name`.
    Describe { name: String },
    /// Serialize and return the dataset bound at `name`.
    Fetch { name: String },
    /// Make a named capability available to the evaluator; idempotent.
    LoadCapability { name: String },
    /// Clean shutdown; acknowledged before the node closes the channel.
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Node → control-process messages.
pub enum Response {
    /// A dataset was bound; `rows` is its current row count.
    Bound { rows: u64 },
    /// Row count and schema of an existing dataset binding.
    Described {
        rows: u64,
        /// Arrow IPC stream with zero batches.
        schema_ipc: Vec<u8>,
    },
    /// Serialized dataset payload.
    Payload {
        rows: u64,
        /// Arrow IPC stream payload.
        ipc: Vec<u8>,
    },
    /// Request succeeded with nothing to report.
    Done,
    /// The node failed to execute the request.
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    body: T,
}

fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    bincode::serialize(&Envelope {
        version: PROTOCOL_VERSION,
        body,
    })
    .map_err(|e| ShfError::Protocol(format!("wire encode failed: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let envelope: Envelope<T> = bincode::deserialize(bytes)
        .map_err(|e| ShfError::Protocol(format!("wire decode failed: {e}")))?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(ShfError::Protocol(format!(
            "protocol version mismatch: peer sent {}, expected {}",
            envelope.version, PROTOCOL_VERSION
        )));
    }
    Ok(envelope.body)
}

/// Encode one request frame body.
pub fn encode_request(req: &Request) -> Result<Vec<u8>> {
    encode(req)
}

/// Decode one request frame body.
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    decode(bytes)
}

/// Encode one response frame body.
pub fn encode_response(resp: &Response) -> Result<Vec<u8>> {
    encode(resp)
}

/// Decode one response frame body.
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    decode(bytes)
}

/// Length-delimited frame codec with the configured size cap.
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// Unwrap a [`Response::Bound`], rejecting anything else as a contract
/// violation by `node`.
pub fn expect_bound(node: NodeId, response: Response) -> Result<u64> {
    match response {
        Response::Bound { rows } => Ok(rows),
        other => Err(unexpected(node, &other)),
    }
}

/// Unwrap a [`Response::Done`].
pub fn expect_done(node: NodeId, response: Response) -> Result<()> {
    match response {
        Response::Done => Ok(()),
        other => Err(unexpected(node, &other)),
    }
}

/// Unwrap a [`Response::Payload`] into `(rows, ipc)`.
pub fn expect_payload(node: NodeId, response: Response) -> Result<(u64, Vec<u8>)> {
    match response {
        Response::Payload { rows, ipc } => Ok((rows, ipc)),
        other => Err(unexpected(node, &other)),
    }
}

/// Unwrap a [`Response::Described`] into `(rows, schema_ipc)`.
pub fn expect_described(node: NodeId, response: Response) -> Result<(u64, Vec<u8>)> {
    match response {
        Response::Described { rows, schema_ipc } => Ok((rows, schema_ipc)),
        other => Err(unexpected(node, &other)),
    }
}

fn unexpected(node: NodeId, response: &Response) -> ShfError {
    ShfError::Protocol(format!("unexpected response from node {node}: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::{
        decode_request, decode_response, encode_request, encode_response, OpEnvelope, Request,
        Response,
    };

    #[test]
    fn request_round_trips() {
        let op = OpEnvelope::from_expr(&serde_json::json!({"op": "identity"}))
            .expect("envelope")
            .bind("threshold", &5_i64)
            .expect("bind");
        let req = Request::Apply {
            source: "shf_b0_s0".to_string(),
            target: "shf_b1_s0".to_string(),
            op,
        };
        let bytes = encode_request(&req).expect("encode");
        let decoded = decode_request(&bytes).expect("decode");
        match decoded {
            Request::Apply { source, target, op } => {
                assert_eq!(source, "shf_b0_s0");
                assert_eq!(target, "shf_b1_s0");
                assert_eq!(op.bindings.len(), 1);
                assert_eq!(op.bindings[0].0, "threshold");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn response_round_trips() {
        let resp = Response::Payload {
            rows: 3,
            ipc: vec![1, 2, 3],
        };
        let bytes = encode_response(&resp).expect("encode");
        match decode_response(&bytes).expect("decode") {
            Response::Payload { rows, ipc } => {
                assert_eq!(rows, 3);
                assert_eq!(ipc, vec![1, 2, 3]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn garbage_frame_is_a_protocol_error() {
        let err = decode_request(&[0xff, 0xff, 0xff]).expect_err("must fail");
        assert!(err.to_string().starts_with("protocol error"));
    }
}
