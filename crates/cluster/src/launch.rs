//! Node bootstrapping.
//!
//! [`NodeLauncher`] is the seam to the process/transport layer: how a worker
//! comes into being and how its byte channel is established. Two launchers
//! are provided: [`LocalLauncher`] runs node runtimes on in-process tasks
//! over duplex pipes (tests, embedded use), and [`ProcessLauncher`] spawns
//! the `shf-node` binary and connects over TCP.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shf_common::{ClusterConfig, NodeId, Result, ShfError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::channel::NodeChannel;
use crate::eval::{BatchOpEvaluator, ExprEvaluator};
use crate::node::NodeRuntime;

/// One launched node: its channel plus the child process handle, if any.
pub struct LaunchedNode {
    pub channel: NodeChannel,
    pub child: Option<Child>,
}

#[async_trait]
/// Process/transport bootstrap contract.
pub trait NodeLauncher: Send + Sync {
    /// Bring up one node and establish its channel.
    async fn launch(&self, node: NodeId, config: &ClusterConfig) -> Result<LaunchedNode>;
}

type EvaluatorFactory = Arc<dyn Fn(NodeId) -> Arc<dyn ExprEvaluator> + Send + Sync>;

/// Runs node runtimes as in-process tasks over duplex pipes.
pub struct LocalLauncher {
    evaluator_factory: EvaluatorFactory,
}

impl fmt::Debug for LocalLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLauncher").finish()
    }
}

impl LocalLauncher {
    /// Launcher whose nodes run the built-in operation evaluator.
    pub fn new() -> Self {
        Self::with_evaluators(|_| Arc::new(BatchOpEvaluator))
    }

    /// Launcher with a per-node evaluator factory.
    pub fn with_evaluators(
        factory: impl Fn(NodeId) -> Arc<dyn ExprEvaluator> + Send + Sync + 'static,
    ) -> Self {
        Self {
            evaluator_factory: Arc::new(factory),
        }
    }
}

impl Default for LocalLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeLauncher for LocalLauncher {
    async fn launch(&self, node: NodeId, config: &ClusterConfig) -> Result<LaunchedNode> {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let runtime = NodeRuntime::new(node, (self.evaluator_factory)(node));
        let max_frame_bytes = config.max_frame_bytes;
        tokio::spawn(async move {
            if let Err(e) = runtime.serve(server, max_frame_bytes).await {
                debug!(node = %node, error = %e, operator = "LocalLaunch", "node runtime exited with error");
            }
        });
        Ok(LaunchedNode {
            channel: NodeChannel::new(node, Box::new(client), config),
            child: None,
        })
    }
}

/// Spawns `shf-node` worker processes and connects over TCP.
///
/// The worker prints one `listening on <addr>` line to stdout; the launcher
/// parses it and connects with bounded retries.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeLauncher for ProcessLauncher {
    async fn launch(&self, node: NodeId, config: &ClusterConfig) -> Result<LaunchedNode> {
        let unavailable = |reason: String| ShfError::NodeUnavailable { node, reason };

        let mut child = Command::new(&config.node_binary)
            .env("SHF_NODE_ID", node.0.to_string())
            .env("SHF_NODE_BIND", "127.0.0.1:0")
            .env("SHF_NODE_MAX_FRAME_BYTES", config.max_frame_bytes.to_string())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| unavailable(format!("spawn '{}' failed: {e}", config.node_binary)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| unavailable("node stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let addr = loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(addr) = line.split("listening on ").nth(1) {
                        break addr.trim().to_string();
                    }
                    debug!(node = %node, line = %line, operator = "ProcessLaunch", "node output");
                }
                Ok(None) => {
                    return Err(unavailable("node exited before announcing its address".to_string()));
                }
                Err(e) => return Err(unavailable(format!("reading node output failed: {e}"))),
            }
        };
        // Drain any later worker output into logs instead of closing the pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(node = %node, line = %line, operator = "ProcessLaunch", "node output");
            }
        });

        let mut attempt = 0;
        let stream = loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt < config.connect_retry_attempts => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(config.connect_retry_ms)).await;
                    debug!(node = %node, attempt, error = %e, operator = "ProcessLaunch", "connect retry");
                }
                Err(e) => {
                    return Err(unavailable(format!("connect to {addr} failed: {e}")));
                }
            }
        };
        Ok(LaunchedNode {
            channel: NodeChannel::new(node, Box::new(stream), config),
            child: Some(child),
        })
    }
}
