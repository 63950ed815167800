//! Row-to-shard assignment.
//!
//! Without a grouping key, rows go to shards in contiguous blocks of
//! `ceil(rows / shard_count)`. With a grouping key, all rows sharing a key
//! value must land on one shard; shard sizes are balanced by greedy
//! bin-packing — groups sorted by descending size, each assigned to the
//! currently least-loaded shard. Heuristic, not optimal, chosen for
//! near-linear cost in the number of groups.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use arrow::record_batch::RecordBatch;
use shf_common::key::{KeyValue, key_rows};
use shf_common::{Result, ShfError};

/// Computed shard layout for one dataset.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    /// Shard index per row, in row order.
    pub row_to_shard: Vec<u32>,
    /// Advisory row count per shard; trailing shards may be empty.
    pub shard_rows: Vec<u64>,
}

/// Assign every row of `batch` to a shard in `[0, shard_count)`.
pub fn assign_rows(
    batch: &RecordBatch,
    grouping_keys: &[String],
    shard_count: usize,
) -> Result<PartitionPlan> {
    if shard_count == 0 {
        return Err(ShfError::Partition("shard count must be positive".to_string()));
    }
    let rows = batch.num_rows();
    let mut shard_rows = vec![0_u64; shard_count];
    if rows == 0 {
        return Ok(PartitionPlan {
            row_to_shard: Vec::new(),
            shard_rows,
        });
    }

    let row_to_shard = if grouping_keys.is_empty() {
        let block = rows.div_ceil(shard_count);
        (0..rows).map(|row| (row / block) as u32).collect()
    } else {
        let keys = key_rows(batch, grouping_keys).map_err(ShfError::Partition)?;
        group_assignment(&keys, shard_count)
    };

    for shard in &row_to_shard {
        shard_rows[*shard as usize] += 1;
    }
    Ok(PartitionPlan {
        row_to_shard,
        shard_rows,
    })
}

/// Greedy bin-packing of whole groups onto shards.
fn group_assignment(keys: &[Vec<KeyValue>], shard_count: usize) -> Vec<u32> {
    let mut sizes: HashMap<&[KeyValue], u64> = HashMap::new();
    let mut order: Vec<&[KeyValue]> = Vec::new();
    for key in keys {
        match sizes.get_mut(key.as_slice()) {
            Some(n) => *n += 1,
            None => {
                sizes.insert(key.as_slice(), 1);
                order.push(key.as_slice());
            }
        }
    }

    // Descending size, first-seen order as the deterministic tie-break.
    let mut groups: Vec<(usize, &[KeyValue])> = order.into_iter().enumerate().collect();
    groups.sort_by_key(|(seen, key)| (Reverse(sizes[key]), *seen));

    // Min-heap keyed by (load, shard index): ties go to the lowest shard.
    let mut heap: BinaryHeap<Reverse<(u64, u32)>> = (0..shard_count as u32)
        .map(|shard| Reverse((0, shard)))
        .collect();
    let mut group_shard: HashMap<&[KeyValue], u32> = HashMap::with_capacity(groups.len());
    for (_, key) in groups {
        let Reverse((load, shard)) = heap.pop().expect("non-empty heap");
        group_shard.insert(key, shard);
        heap.push(Reverse((load + sizes[key], shard)));
    }

    keys.iter().map(|key| group_shard[key.as_slice()]).collect()
}
