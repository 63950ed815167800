//! Node channels, worker runtime, and cluster lifecycle for shardframe.
//!
//! Architecture role:
//! - defines the wire protocol between the control process and nodes;
//! - hosts the node-side runtime and the evaluator seam;
//! - provides cluster creation, fan-out operations, and teardown.
//!
//! Key modules:
//! - [`protocol`] — framed bincode messages, opaque operation envelopes
//! - [`channel`] — one-outstanding-request channel per node
//! - [`node`] — binding namespace + serve loop
//! - [`eval`] — [`ExprEvaluator`] seam and built-in operation set
//! - [`launch`] — in-process and child-process node bootstrap
//! - [`cluster`] — lifecycle, fan-outs, default-cluster context

pub mod channel;
pub mod cluster;
pub mod eval;
pub mod launch;
pub mod node;
pub mod protocol;

pub use channel::NodeChannel;
pub use cluster::{Cluster, ClusterContext};
pub use eval::{BatchOp, BatchOpEvaluator, BindingEnv, CmpOp, ExprEvaluator, Operand};
pub use launch::{LaunchedNode, LocalLauncher, NodeLauncher, ProcessLauncher};
pub use node::NodeRuntime;
pub use protocol::{OpEnvelope, Request, Response};
