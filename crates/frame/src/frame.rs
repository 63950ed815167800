//! The sharded-frame handle.
//!
//! A [`ShardFrame`] describes node-resident data at a point in time: a
//! cluster reference plus one descriptor per shard, in creation order. The
//! handle is an immutable value — dispatch returns a new frame and never
//! mutates the old one, so a pre-failure frame always stays usable. Once a
//! frame chain is created, rows never migrate between nodes; operations
//! change shard contents in place, never shard location.

use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use shf_cluster::protocol::{self, Request};
use shf_cluster::{Cluster, ClusterContext};
use shf_common::{NodeId, Result, ShfError, ipc};
use tracing::info;

use crate::distribute;
use crate::partition;

/// Where one shard lives: its node, remote binding name, and advisory row
/// count (refreshed on every dispatch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDesc {
    pub node: NodeId,
    pub binding: String,
    pub rows: u64,
}

/// Partitioning controls for [`ShardFrame::partition`].
#[derive(Clone, Default)]
pub struct PartitionOptions {
    /// Grouping-key columns; empty means no locality constraint.
    pub grouping_keys: Vec<String>,
    /// Shard count; defaults to the cluster's node count.
    pub shard_count: Option<usize>,
    /// Override for the shard→node mapping; default is `shard % node_count`.
    pub node_for_shard: Option<Arc<dyn Fn(u32, usize) -> u32 + Send + Sync>>,
}

impl fmt::Debug for PartitionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionOptions")
            .field("grouping_keys", &self.grouping_keys)
            .field("shard_count", &self.shard_count)
            .field("node_for_shard", &self.node_for_shard.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl PartitionOptions {
    /// Options with the given grouping-key columns.
    pub fn grouped_by<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            grouping_keys: keys.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Handle to a dataset partitioned across a cluster's nodes.
#[derive(Debug, Clone)]
pub struct ShardFrame {
    cluster: Cluster,
    shards: Vec<ShardDesc>,
    grouping_keys: Vec<String>,
    schema: SchemaRef,
}

impl ShardFrame {
    /// Partition `batch` across the cluster and push each shard out.
    ///
    /// The empty dataset partitions into zero shards; collecting it returns
    /// an empty dataset with the original schema.
    pub async fn partition(
        cluster: &Cluster,
        batch: &RecordBatch,
        opts: PartitionOptions,
    ) -> Result<ShardFrame> {
        let shard_count = opts.shard_count.unwrap_or_else(|| cluster.node_count());
        let plan = partition::assign_rows(batch, &opts.grouping_keys, shard_count)?;
        let shards = distribute::distribute(cluster, batch, &plan, &opts).await?;
        info!(
            rows = batch.num_rows(),
            shards = shards.len(),
            nodes = cluster.node_count(),
            operator = "Partition",
            "dataset partitioned"
        );
        Ok(ShardFrame {
            cluster: cluster.clone(),
            shards,
            grouping_keys: opts.grouping_keys,
            schema: batch.schema(),
        })
    }

    /// [`ShardFrame::partition`] against the context's default cluster.
    pub async fn partition_default(
        ctx: &ClusterContext,
        batch: &RecordBatch,
        opts: PartitionOptions,
    ) -> Result<ShardFrame> {
        let cluster = ctx.require_default()?;
        Self::partition(&cluster, batch, opts).await
    }

    /// Wrap a pre-populated remote binding as a frame without moving data:
    /// one shard per node, in node order. The binding must exist on every
    /// node with a consistent schema (e.g. bound via
    /// [`Cluster::assign_expr`]).
    pub async fn from_bindings(cluster: &Cluster, binding: &str) -> Result<ShardFrame> {
        let described = cluster
            .fan_out("FrameFromBindings", |_, channel| {
                let request = Request::Describe {
                    name: binding.to_string(),
                };
                async move {
                    let response = channel.request(&request).await?;
                    protocol::expect_described(channel.node(), response)
                }
            })
            .await?;

        let mut schema: Option<SchemaRef> = None;
        let mut shards = Vec::with_capacity(described.len());
        for (node_index, (rows, schema_ipc)) in described.into_iter().enumerate() {
            let (node_schema, _) = ipc::decode_stream(&schema_ipc)?;
            match &schema {
                None => schema = Some(node_schema),
                Some(expected) if *expected == node_schema => {}
                Some(_) => {
                    return Err(ShfError::Protocol(format!(
                        "binding '{binding}' has inconsistent schemas across nodes"
                    )));
                }
            }
            shards.push(ShardDesc {
                node: NodeId(node_index as u32),
                binding: binding.to_string(),
                rows,
            });
        }
        let schema = schema.ok_or_else(|| {
            ShfError::ClusterLifecycle("cluster has no nodes to describe".to_string())
        })?;
        info!(
            binding = %binding,
            shards = shards.len(),
            operator = "FrameFromBindings",
            "remote bindings wrapped as frame"
        );
        Ok(ShardFrame {
            cluster: cluster.clone(),
            shards,
            grouping_keys: Vec::new(),
            schema,
        })
    }

    /// Build a frame from parts; dispatch uses this to produce successors.
    pub(crate) fn with_shards(&self, shards: Vec<ShardDesc>) -> ShardFrame {
        ShardFrame {
            cluster: self.cluster.clone(),
            shards,
            grouping_keys: self.grouping_keys.clone(),
            schema: self.schema.clone(),
        }
    }

    /// The cluster this frame's shards live on.
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Number of nodes in the underlying cluster.
    pub fn node_count(&self) -> usize {
        self.cluster.node_count()
    }

    /// Number of shards; at most one per node under default assignment, zero
    /// for the empty dataset.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard descriptors in creation order.
    pub fn shards(&self) -> &[ShardDesc] {
        &self.shards
    }

    /// Advisory per-shard row counts, in shard order.
    pub fn shard_rows(&self) -> Vec<u64> {
        self.shards.iter().map(|s| s.rows).collect()
    }

    /// Advisory total row count.
    pub fn total_rows(&self) -> u64 {
        self.shards.iter().map(|s| s.rows).sum()
    }

    /// Grouping-key columns this frame was partitioned by.
    pub fn grouping_keys(&self) -> &[String] {
        &self.grouping_keys
    }

    /// Schema observed at frame creation; collection of an empty frame
    /// reproduces it.
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl fmt::Display for ShardFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sharded frame: {} shards on {} nodes, {} rows",
            self.shard_count(),
            self.node_count(),
            self.total_rows()
        )?;
        let rows = self.shard_rows();
        if let (Some(min), Some(max)) = (rows.iter().min(), rows.iter().max()) {
            write!(f, " (shard sizes {min}..{max})")?;
        }
        if !self.grouping_keys.is_empty() {
            write!(f, " grouped by {}", self.grouping_keys.join(", "))?;
        }
        Ok(())
    }
}
