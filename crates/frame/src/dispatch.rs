//! Dispatching one operation to every shard.

use futures::future::join_all;
use shf_cluster::protocol::{self, OpEnvelope, Request};
use shf_common::{Result, global_metrics};
use tracing::{debug, warn};

use crate::distribute::next_binding_name;
use crate::frame::{ShardDesc, ShardFrame};

impl ShardFrame {
    /// Apply `op` to every shard in place and return the successor frame.
    ///
    /// Each shard's node evaluates the operation against the shard's current
    /// binding and rebinds the result under a fresh name; no data returns to
    /// the control process. Descriptors keep the input shard order, with row
    /// counts refreshed from the nodes. Captured bindings in `op` are
    /// shipped with this call only.
    ///
    /// Failure is loud and not transactional: the first failing shard (in
    /// shard order) fails the whole call with its node's identity, and no
    /// successor frame is produced — but nodes that already answered keep
    /// their new bindings. Callers must treat a failed dispatch as
    /// not-happened; `self` remains valid and collectible either way. There
    /// is no per-node snapshot/rollback.
    pub async fn dispatch(&self, op: &OpEnvelope) -> Result<ShardFrame> {
        global_metrics().inc_fanout("Dispatch");
        let calls: Vec<_> = self
            .shards()
            .iter()
            .enumerate()
            .map(|(shard, desc)| {
                let target = next_binding_name(shard as u32);
                let channel = self.cluster().channel(desc.node);
                let request = Request::Apply {
                    source: desc.binding.clone(),
                    target: target.clone(),
                    op: op.clone(),
                };
                let node = desc.node;
                async move {
                    let response = channel?.request(&request).await?;
                    let rows = protocol::expect_bound(node, response)?;
                    debug!(node = %node, binding = %target, rows, operator = "Dispatch", "shard rebound");
                    Ok(ShardDesc {
                        node,
                        binding: target,
                        rows,
                    })
                }
            })
            .collect();

        let results = join_all(calls).await;
        let mut shards = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(desc) => shards.push(desc),
                Err(e) => {
                    global_metrics().inc_fanout_failure("Dispatch");
                    warn!(error = %e, operator = "Dispatch", "dispatch failed; prior frame remains valid");
                    return Err(e);
                }
            }
        }
        Ok(self.with_shards(shards))
    }
}
