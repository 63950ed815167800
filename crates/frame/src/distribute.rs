//! Shard extraction and push-out to nodes.
//!
//! Each non-empty shard's rows are gathered with the Arrow `take` kernel
//! (stable relative to source order), serialized as an IPC stream, and bound
//! on the assigned node under a freshly generated unique name. Sends proceed
//! concurrently across nodes; shards that land on the same node serialize on
//! that node's channel.

use std::sync::atomic::{AtomicU64, Ordering};

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::record_batch::RecordBatch;
use futures::future::join_all;
use shf_cluster::protocol::{self, Request};
use shf_cluster::Cluster;
use shf_common::{NodeId, Result, ShfError, global_metrics, ipc};
use tracing::debug;

use crate::frame::{PartitionOptions, ShardDesc};
use crate::partition::PartitionPlan;

static BINDING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Fresh remote binding name, unique within this control process.
pub(crate) fn next_binding_name(shard: u32) -> String {
    format!("shf_b{}_s{}", BINDING_SEQ.fetch_add(1, Ordering::Relaxed), shard)
}

/// Materialize each non-empty shard as its own batch, in shard order.
fn shard_batches(batch: &RecordBatch, plan: &PartitionPlan) -> Result<Vec<(u32, RecordBatch)>> {
    let shard_count = plan.shard_rows.len();
    let mut indices: Vec<Vec<u32>> = vec![Vec::new(); shard_count];
    for (row, shard) in plan.row_to_shard.iter().enumerate() {
        indices[*shard as usize].push(row as u32);
    }

    let mut out = Vec::new();
    for (shard, rows) in indices.into_iter().enumerate() {
        if rows.is_empty() {
            continue;
        }
        let picks = UInt32Array::from(rows);
        let columns: Vec<ArrayRef> = batch
            .columns()
            .iter()
            .map(|col| take(col.as_ref(), &picks, None))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| ShfError::Protocol(format!("shard extraction failed: {e}")))?;
        let shard_batch = RecordBatch::try_new(batch.schema(), columns)
            .map_err(|e| ShfError::Protocol(format!("shard build failed: {e}")))?;
        out.push((shard as u32, shard_batch));
    }
    Ok(out)
}

/// Resolve the node for each shard: default `shard % node_count`, with an
/// optional caller override.
fn node_for_shard(shard: u32, node_count: usize, opts: &PartitionOptions) -> Result<NodeId> {
    let node = match &opts.node_for_shard {
        Some(assign) => assign(shard, node_count),
        None => shard % node_count as u32,
    };
    if node as usize >= node_count {
        return Err(ShfError::Partition(format!(
            "node assignment for shard {shard} returned node {node}, cluster has {node_count} nodes"
        )));
    }
    Ok(NodeId(node))
}

/// Push every non-empty shard to its node and record the descriptors.
pub(crate) async fn distribute(
    cluster: &Cluster,
    batch: &RecordBatch,
    plan: &PartitionPlan,
    opts: &PartitionOptions,
) -> Result<Vec<ShardDesc>> {
    let shards = shard_batches(batch, plan)?;
    let node_count = cluster.node_count();
    global_metrics().inc_fanout("Distribute");

    let mut sends = Vec::with_capacity(shards.len());
    for (shard, shard_batch) in &shards {
        let node = node_for_shard(*shard, node_count, opts)?;
        let channel = cluster.channel(node)?;
        let binding = next_binding_name(*shard);
        let payload = ipc::encode_batch(shard_batch)?;
        global_metrics().record_send("Distribute", shard_batch.num_rows() as u64, payload.len() as u64);
        sends.push(async move {
            let response = channel
                .request(&Request::AssignBatch {
                    name: binding.clone(),
                    ipc: payload,
                })
                .await?;
            let rows = protocol::expect_bound(node, response)?;
            debug!(node = %node, binding = %binding, rows, operator = "Distribute", "shard bound");
            Ok::<ShardDesc, ShfError>(ShardDesc {
                node,
                binding,
                rows,
            })
        });
    }

    let results = join_all(sends).await;
    let mut descriptors = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(desc) => descriptors.push(desc),
            Err(e) => {
                global_metrics().inc_fanout_failure("Distribute");
                return Err(e);
            }
        }
    }
    Ok(descriptors)
}
