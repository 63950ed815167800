//! Cluster lifecycle and cluster-wide fan-out operations.
//!
//! A [`Cluster`] is an ordered pool of node channels behind a cheaply
//! clonable handle. Teardown is reference-counted: when the last handle
//! (including handles held by frames) drops, every node receives a
//! best-effort shutdown request and child processes are killed. Explicit
//! [`Cluster::shutdown`] does the same eagerly and is idempotent.
//!
//! Fan-out semantics are whole-call: requests go to all nodes concurrently,
//! and the first failing node (in node order) fails the entire call with its
//! identity attached. Teardown failures are logged, never propagated.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use serde_json::Value;
use shf_common::{ClusterConfig, NodeId, Result, ShfError, global_metrics};
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::channel::NodeChannel;
use crate::launch::NodeLauncher;
use crate::protocol::{self, OpEnvelope, Request};

/// Handle to a pool of worker nodes. Clones share the same pool.
#[derive(Clone, Debug)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    config: ClusterConfig,
    nodes: Vec<Arc<NodeChannel>>,
    children: std::sync::Mutex<Vec<Child>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ClusterInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterInner")
            .field("nodes", &self.nodes.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Cluster {
    /// Launch `config.node_count` nodes and return a live cluster.
    ///
    /// All-or-nothing: if any node fails to come up, nodes that did start are
    /// torn down and the call fails with that node's identity.
    pub async fn create(config: ClusterConfig, launcher: &dyn NodeLauncher) -> Result<Cluster> {
        if config.node_count == 0 {
            return Err(ShfError::ClusterLifecycle(
                "cluster needs at least one node".to_string(),
            ));
        }
        let launches = join_all(
            (0..config.node_count).map(|i| launcher.launch(NodeId(i as u32), &config)),
        )
        .await;

        let mut nodes = Vec::with_capacity(config.node_count);
        let mut children = Vec::new();
        let mut failure = None;
        for launch in launches {
            match launch {
                Ok(launched) => {
                    nodes.push(Arc::new(launched.channel));
                    if let Some(child) = launched.child {
                        children.push(child);
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(error) = failure {
            warn!(error = %error, operator = "ClusterCreate", "node launch failed; tearing down partial cluster");
            for channel in &nodes {
                if let Err(e) = channel.request(&Request::Shutdown).await {
                    debug!(node = %channel.node(), error = %e, operator = "ClusterCreate", "teardown request failed");
                }
            }
            for child in &mut children {
                let _ = child.start_kill();
            }
            return Err(error);
        }

        info!(
            nodes = nodes.len(),
            operator = "ClusterCreate",
            "cluster started"
        );
        Ok(Cluster {
            inner: Arc::new(ClusterInner {
                config,
                nodes,
                children: std::sync::Mutex::new(children),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Number of nodes; fixed for the cluster's lifetime.
    pub fn node_count(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Cluster configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Channel to one node, by index.
    pub fn channel(&self, node: NodeId) -> Result<Arc<NodeChannel>> {
        self.ensure_live()?;
        self.inner
            .nodes
            .get(node.0 as usize)
            .cloned()
            .ok_or_else(|| {
                ShfError::ClusterLifecycle(format!(
                    "node {node} out of range for {}-node cluster",
                    self.inner.nodes.len()
                ))
            })
    }

    /// Bind `values[i]` under `name` on node `i` — heterogeneous private
    /// inputs outside the partitioning path (e.g. distinct file paths).
    pub async fn assign_each(&self, name: &str, values: &[Value]) -> Result<()> {
        if values.len() != self.node_count() {
            return Err(ShfError::ClusterLifecycle(format!(
                "assign_each needs one value per node: got {}, cluster has {}",
                values.len(),
                self.node_count()
            )));
        }
        let encoded: Vec<Vec<u8>> = values
            .iter()
            .map(|v| {
                serde_json::to_vec(v)
                    .map_err(|e| ShfError::Protocol(format!("value encode failed: {e}")))
            })
            .collect::<Result<_>>()?;
        self.fan_out("ClusterAssignEach", |i, channel| {
            let value_json = encoded[i].clone();
            let name = name.to_string();
            async move {
                let response = channel
                    .request(&Request::AssignValue { name, value_json })
                    .await?;
                protocol::expect_done(channel.node(), response)
            }
        })
        .await?;
        Ok(())
    }

    /// Evaluate `op` once on every node and bind the result under `name`.
    /// Returns per-node row counts in node order.
    pub async fn assign_expr(&self, name: &str, op: &OpEnvelope) -> Result<Vec<u64>> {
        self.fan_out("ClusterAssignExpr", |_, channel| {
            let request = Request::Eval {
                target: name.to_string(),
                op: op.clone(),
            };
            async move {
                let response = channel.request(&request).await?;
                protocol::expect_bound(channel.node(), response)
            }
        })
        .await
    }

    /// Ensure a named capability is available on every node before any
    /// operation referencing it is dispatched. Idempotent per node.
    pub async fn load_capability(&self, name: &str) -> Result<()> {
        self.fan_out("ClusterLoadCapability", |_, channel| {
            let request = Request::LoadCapability {
                name: name.to_string(),
            };
            async move {
                let response = channel.request(&request).await?;
                protocol::expect_done(channel.node(), response)
            }
        })
        .await?;
        Ok(())
    }

    /// Issue concurrent per-node requests and collect results in node order.
    /// The first failing node (in node order) fails the whole call.
    pub async fn fan_out<T, F, Fut>(&self, operator: &'static str, make: F) -> Result<Vec<T>>
    where
        F: Fn(usize, Arc<NodeChannel>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_live()?;
        global_metrics().inc_fanout(operator);
        let calls: Vec<_> = self
            .inner
            .nodes
            .iter()
            .enumerate()
            .map(|(i, channel)| make(i, Arc::clone(channel)))
            .collect();
        let results = join_all(calls).await;
        let mut out = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(value) => out.push(value),
                Err(e) => {
                    global_metrics().inc_fanout_failure(operator);
                    warn!(operator, error = %e, "fan-out failed");
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ShfError::ClusterLifecycle(
                "cluster is shut down".to_string(),
            ));
        }
        Ok(())
    }

    /// Request a clean shutdown of every node. Best-effort and idempotent:
    /// per-node failures are logged, never propagated.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for channel in &self.inner.nodes {
            if let Err(e) = channel.request(&Request::Shutdown).await {
                debug!(node = %channel.node(), error = %e, operator = "ClusterShutdown", "shutdown request failed");
            }
        }
        self.inner.kill_children();
        info!(operator = "ClusterShutdown", "cluster shut down");
    }
}

impl ClusterInner {
    fn kill_children(&self) {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        for child in children.iter_mut() {
            let _ = child.start_kill();
        }
        children.clear();
    }
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Last handle is gone; shutdown requests must run off-thread since
        // Drop cannot await.
        let nodes = self.nodes.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for channel in nodes {
                        if let Err(e) = channel.request(&Request::Shutdown).await {
                            debug!(node = %channel.node(), error = %e, operator = "ClusterTeardown", "shutdown request failed");
                        }
                    }
                });
            }
            Err(_) => {
                debug!(
                    operator = "ClusterTeardown",
                    "no async runtime at teardown; closing channels without shutdown handshake"
                );
            }
        }
        self.kill_children();
    }
}

/// Process-scoped default-cluster slot.
///
/// Explicitly threaded through callers rather than hidden module state: one
/// current default, overwritten on each set, read by partition calls that
/// omit an explicit cluster.
#[derive(Debug, Default)]
pub struct ClusterContext {
    slot: std::sync::RwLock<Option<Cluster>>,
}

impl ClusterContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `cluster` as the default, returning the previous one.
    pub fn set_default(&self, cluster: Cluster) -> Option<Cluster> {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        slot.replace(cluster)
    }

    /// The current default cluster, if one is installed.
    pub fn default_cluster(&self) -> Option<Cluster> {
        let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
        slot.clone()
    }

    /// Remove and return the current default.
    pub fn clear(&self) -> Option<Cluster> {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        slot.take()
    }

    /// The current default cluster, or a lifecycle error if none is set.
    pub fn require_default(&self) -> Result<Cluster> {
        self.default_cluster().ok_or_else(|| {
            ShfError::ClusterLifecycle("no default cluster configured".to_string())
        })
    }
}
