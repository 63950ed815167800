//! Gathering shard contents back into one local dataset.

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use futures::future::join_all;
use shf_cluster::protocol::{self, Request};
use shf_common::{Result, ShfError, global_metrics, ipc};
use tracing::{debug, warn};

use crate::frame::ShardFrame;

impl ShardFrame {
    /// Fetch every shard's current binding and concatenate in shard order.
    ///
    /// Shard order is creation order, not a global row order: two frames
    /// over the same rows but different partitionings collect in different
    /// orders. Aggregate shards contribute one row each; a zero-shard frame
    /// collects as an empty dataset with the creation-time schema. Remote
    /// state is not touched — the frame stays collectible afterwards.
    ///
    /// Whole-call: any node failure aborts the collection and no partial
    /// dataset is returned.
    pub async fn collect(&self) -> Result<RecordBatch> {
        if self.shard_count() == 0 {
            return Ok(RecordBatch::new_empty(self.schema()));
        }
        global_metrics().inc_fanout("Collect");
        let calls: Vec<_> = self
            .shards()
            .iter()
            .map(|desc| {
                let channel = self.cluster().channel(desc.node);
                let request = Request::Fetch {
                    name: desc.binding.clone(),
                };
                let node = desc.node;
                async move {
                    let response = channel?.request(&request).await?;
                    protocol::expect_payload(node, response)
                }
            })
            .collect();

        let results = join_all(calls).await;
        let mut batches = Vec::new();
        for (shard, result) in results.into_iter().enumerate() {
            match result {
                Ok((rows, payload)) => {
                    global_metrics().record_receive("Collect", rows, payload.len() as u64);
                    let (_, mut shard_batches) = ipc::decode_stream(&payload)?;
                    debug!(shard, rows, operator = "Collect", "shard fetched");
                    batches.append(&mut shard_batches);
                }
                Err(e) => {
                    global_metrics().inc_fanout_failure("Collect");
                    warn!(error = %e, operator = "Collect", "collection failed");
                    return Err(e);
                }
            }
        }

        let schema = batches
            .first()
            .map(|b| b.schema())
            .unwrap_or_else(|| self.schema());
        concat_batches(&schema, &batches)
            .map_err(|e| ShfError::Protocol(format!("collected shards do not concatenate: {e}")))
    }
}
