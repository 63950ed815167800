//! Partitioning, sharded-frame handle, dispatch, and collection.
//!
//! Architecture role:
//! - assigns rows to shards (grouping-key locality + greedy balance);
//! - pushes shards out to cluster nodes and tracks them via [`ShardFrame`];
//! - dispatches operations to all shards in place and collects results.
//!
//! Key modules:
//! - [`partition`] — row→shard assignment
//! - [`distribute`] — shard extraction and push-out
//! - [`frame`] — the [`ShardFrame`] handle and virtual-source adapter
//! - [`dispatch`] / [`collect`] — the in-place transform and gather calls
//!
//! Typical flow:
//!
//! ```text
//! RecordBatch -> ShardFrame::partition -> dispatch* -> collect -> RecordBatch
//! ```

pub mod collect;
pub mod dispatch;
pub mod distribute;
pub mod frame;
pub mod partition;

pub use frame::{PartitionOptions, ShardDesc, ShardFrame};
pub use partition::PartitionPlan;
