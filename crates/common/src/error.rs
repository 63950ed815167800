use thiserror::Error;

use crate::ids::NodeId;

/// Canonical shardframe error taxonomy used across crates.
///
/// Classification guidance:
/// - [`ShfError::NodeUnavailable`]: channel broken, process dead, or request timed out
/// - [`ShfError::Evaluation`]: a node reported an error while executing an operation
/// - [`ShfError::Partition`]: invalid shard layout requests discovered before any send
/// - [`ShfError::ClusterLifecycle`]: calls against a torn-down or misused cluster
/// - [`ShfError::Protocol`]: wire/IPC encode-decode contract violations
/// - [`ShfError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum ShfError {
    /// The channel to a node is unusable.
    ///
    /// Examples:
    /// - connect/spawn failure during cluster creation
    /// - broken pipe or closed socket mid-request
    /// - per-request timeout elapsed (when configured)
    #[error("node {node} unavailable: {reason}")]
    NodeUnavailable {
        /// Index of the unreachable node.
        node: NodeId,
        /// Underlying transport failure.
        reason: String,
    },

    /// A node executed an operation and reported failure.
    ///
    /// Examples:
    /// - unknown remote binding or column name
    /// - operation payload the node-side evaluator does not recognize
    /// - type mismatch between an operand and a column
    #[error("evaluation failed on node {node}: {message}")]
    Evaluation {
        /// Index of the node that reported the failure.
        node: NodeId,
        /// Error message as reported by the node.
        message: String,
    },

    /// Invalid partitioning request.
    ///
    /// Examples:
    /// - zero shard count
    /// - unsupported grouping-key column type
    /// - node-assignment override returning an out-of-range node
    #[error("partition error: {0}")]
    Partition(String),

    /// Operation attempted against a cluster in the wrong lifecycle state.
    ///
    /// Examples:
    /// - fan-out after shutdown
    /// - per-node value list whose length does not match the node count
    /// - no default cluster configured in the context
    #[error("cluster lifecycle error: {0}")]
    ClusterLifecycle(String),

    /// Wire or payload encoding contract violation on either side.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard shardframe result alias.
pub type Result<T> = std::result::Result<T, ShfError>;
