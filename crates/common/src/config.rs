use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Cluster-wide behavior/configuration knobs.
pub struct ClusterConfig {
    /// Number of worker node processes in the cluster.
    pub node_count: usize,
    /// Per-request timeout in milliseconds; `0` disables the timeout.
    ///
    /// A timed-out request is reported as node-unavailable, since the node
    /// cannot be distinguished from a dead one mid-call.
    pub request_timeout_ms: u64,
    /// Maximum wire frame size accepted on a node channel.
    pub max_frame_bytes: usize,
    /// Worker binary name or path used by the process launcher.
    pub node_binary: String,
    /// Delay between connect attempts to a freshly spawned node.
    pub connect_retry_ms: u64,
    /// Connect attempts before a spawned node is declared unavailable.
    pub connect_retry_attempts: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_count: 2,
            request_timeout_ms: 0,
            max_frame_bytes: 256 * 1024 * 1024,
            node_binary: "shf-node".to_string(),
            connect_retry_ms: 50,
            connect_retry_attempts: 40,
        }
    }
}
