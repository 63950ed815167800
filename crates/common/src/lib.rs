//! Shared configuration, error types, IDs, and data-plumbing primitives for
//! shardframe crates.
//!
//! Architecture role:
//! - defines cluster configuration passed across layers
//! - provides common [`ShfError`] / [`Result`] contracts
//! - hosts Arrow IPC helpers, grouping-key extraction, and metrics
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`ipc`]
//! - [`key`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod ipc;
pub mod key;
pub mod metrics;

pub use config::ClusterConfig;
pub use error::{Result, ShfError};
pub use ids::NodeId;
pub use metrics::{MetricsRegistry, global_metrics};
