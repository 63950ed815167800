//! Request/response channel to one node.
//!
//! A channel owns a framed byte stream and enforces the one-outstanding-
//! request-per-node contract: callers that overlap on the same node queue on
//! the channel lock rather than interleaving frames. Transport failures and
//! optional per-request timeouts surface as node-unavailable; node-reported
//! failures surface as evaluation errors carrying the node index.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use shf_common::{ClusterConfig, NodeId, Result, ShfError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use crate::protocol::{self, Request, Response};

/// Byte transport a node channel can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Bidirectional request/response channel to one worker node.
pub struct NodeChannel {
    node: NodeId,
    request_timeout: Option<Duration>,
    framed: Mutex<Framed<Box<dyn ByteStream>, tokio_util::codec::LengthDelimitedCodec>>,
}

impl fmt::Debug for NodeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeChannel").field("node", &self.node).finish()
    }
}

impl NodeChannel {
    /// Wrap an established byte stream as a node channel.
    pub fn new(node: NodeId, stream: Box<dyn ByteStream>, config: &ClusterConfig) -> Self {
        let request_timeout = match config.request_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Self {
            node,
            request_timeout,
            framed: Mutex::new(Framed::new(stream, protocol::frame_codec(config.max_frame_bytes))),
        }
    }

    /// Index of the node this channel talks to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Send one request and await its response.
    ///
    /// Requests to the same node serialize here; there is no pipelining.
    pub async fn request(&self, req: &Request) -> Result<Response> {
        let bytes = protocol::encode_request(req)?;
        let mut framed = self.framed.lock().await;
        let exchange = async {
            framed
                .send(Bytes::from(bytes))
                .await
                .map_err(|e| self.unavailable(format!("send failed: {e}")))?;
            match framed.next().await {
                Some(Ok(frame)) => protocol::decode_response(&frame),
                Some(Err(e)) => Err(self.unavailable(format!("receive failed: {e}"))),
                None => Err(self.unavailable("channel closed".to_string())),
            }
        };
        let response = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| self.unavailable(format!("request timed out after {limit:?}")))??,
            None => exchange.await?,
        };
        match response {
            Response::Error { message } => Err(ShfError::Evaluation {
                node: self.node,
                message,
            }),
            other => Ok(other),
        }
    }

    fn unavailable(&self, reason: String) -> ShfError {
        ShfError::NodeUnavailable {
            node: self.node,
            reason,
        }
    }
}
