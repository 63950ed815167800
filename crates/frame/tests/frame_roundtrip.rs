use std::sync::Arc;

use arrow::array::{Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use shf_cluster::{BatchOp, Cluster, CmpOp, LocalLauncher, OpEnvelope, Operand};
use shf_common::ClusterConfig;
use shf_frame::{PartitionOptions, ShardFrame};

async fn local_cluster(node_count: usize) -> Cluster {
    let config = ClusterConfig {
        node_count,
        ..ClusterConfig::default()
    };
    Cluster::create(config, &LocalLauncher::new())
        .await
        .expect("cluster")
}

fn two_column_batch(keys: Vec<i64>, values: Vec<i64>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("g", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(keys)),
            Arc::new(Int64Array::from(values)),
        ],
    )
    .expect("batch")
}

/// 300 rows over seven groups of sizes 80, 70, 60, 40, 30, 15, 5, striped so
/// no group is contiguous in the source.
fn seven_group_batch() -> RecordBatch {
    let sizes = [80_usize, 70, 60, 40, 30, 15, 5];
    let mut keys = Vec::new();
    let mut values = Vec::new();
    let mut next = 0_i64;
    for stripe in 0..80 {
        for (group, size) in sizes.iter().enumerate() {
            if stripe < *size {
                keys.push(group as i64);
                values.push(next);
                next += 1;
            }
        }
    }
    assert_eq!(keys.len(), 300);
    two_column_batch(keys, values)
}

fn int_column(batch: &RecordBatch, name: &str) -> Vec<i64> {
    let col = batch
        .column_by_name(name)
        .unwrap_or_else(|| panic!("column {name}"))
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column");
    (0..col.len()).map(|i| col.value(i)).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_trip_reproduces_rows_without_grouping() {
    let cluster = local_cluster(3).await;
    let batch = two_column_batch((0..10).collect(), (100..110).collect());

    let frame = ShardFrame::partition(&cluster, &batch, PartitionOptions::default())
        .await
        .expect("partition");
    assert_eq!(frame.total_rows(), 10);
    assert_eq!(frame.shard_count(), 3);

    let collected = frame.collect().await.expect("collect");
    assert_eq!(collected.num_rows(), 10);
    // Global order across shard boundaries is not guaranteed; compare as a
    // multiset keyed by the value column.
    let mut got = int_column(&collected, "v");
    got.sort_unstable();
    assert_eq!(got, (100..110).collect::<Vec<_>>());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grouped_count_recovers_group_sizes() {
    let cluster = local_cluster(7).await;
    let batch = seven_group_batch();

    let frame = ShardFrame::partition(&cluster, &batch, PartitionOptions::grouped_by(["g"]))
        .await
        .expect("partition");
    assert_eq!(frame.shard_count(), 7, "one group per shard");
    assert_eq!(frame.total_rows(), 300);
    let mut shard_sizes = frame.shard_rows();
    shard_sizes.sort_unstable();
    assert_eq!(shard_sizes, vec![5, 15, 30, 40, 60, 70, 80]);

    let counted = frame
        .dispatch(
            &OpEnvelope::from_expr(&BatchOp::CountBy {
                keys: vec!["g".to_string()],
                alias: "n".to_string(),
            })
            .expect("envelope"),
        )
        .await
        .expect("dispatch");
    assert_eq!(counted.shard_rows(), vec![1; 7], "one aggregate row per shard");

    let collected = counted.collect().await.expect("collect");
    assert_eq!(collected.num_rows(), 7);
    let mut counts = int_column(&collected, "n");
    counts.sort_unstable();
    assert_eq!(counts, vec![5, 15, 30, 40, 60, 70, 80]);
    assert_eq!(counts.iter().sum::<i64>(), 300);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatch_refreshes_advisory_row_counts() {
    let cluster = local_cluster(3).await;
    let batch = two_column_batch((0..12).map(|i| i % 4).collect(), (0..12).collect());

    let frame = ShardFrame::partition(&cluster, &batch, PartitionOptions::grouped_by(["g"]))
        .await
        .expect("partition");

    let cutoff = 5_i64;
    let filtered = frame
        .dispatch(
            &OpEnvelope::from_expr(&BatchOp::Filter {
                column: "v".to_string(),
                cmp: CmpOp::Ge,
                value: Operand::Var {
                    var: "cutoff".to_string(),
                },
            })
            .expect("envelope")
            .bind("cutoff", &cutoff)
            .expect("bind"),
        )
        .await
        .expect("dispatch");

    assert_eq!(filtered.total_rows(), 7, "rows 5..12 survive");
    let collected = filtered.collect().await.expect("collect");
    let mut got = int_column(&collected, "v");
    got.sort_unstable();
    assert_eq!(got, (5..12).collect::<Vec<_>>());

    // The pre-dispatch frame is stale but still valid.
    assert_eq!(frame.total_rows(), 12);
    assert_eq!(frame.collect().await.expect("stale collect").num_rows(), 12);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_dispatch_is_deterministic() {
    let cluster = local_cluster(4).await;
    let batch = two_column_batch((0..40).map(|i| i % 5).collect(), (0..40).collect());
    let frame = ShardFrame::partition(&cluster, &batch, PartitionOptions::grouped_by(["g"]))
        .await
        .expect("partition");

    let op = OpEnvelope::from_expr(&BatchOp::Filter {
        column: "v".to_string(),
        cmp: CmpOp::Lt,
        value: Operand::Lit(serde_json::json!(25)),
    })
    .expect("envelope");

    let first = frame.dispatch(&op).await.expect("first dispatch");
    let second = frame.dispatch(&op).await.expect("second dispatch");
    assert_eq!(first.shard_rows(), second.shard_rows());

    let a = first.collect().await.expect("first collect");
    let b = second.collect().await.expect("second collect");
    assert_eq!(int_column(&a, "g"), int_column(&b, "g"));
    assert_eq!(int_column(&a, "v"), int_column(&b, "v"));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn summary_operation_yields_one_row_per_shard() {
    let cluster = local_cluster(3).await;
    let batch = two_column_batch((0..9).collect(), (0..9).collect());
    let frame = ShardFrame::partition(&cluster, &batch, PartitionOptions::default())
        .await
        .expect("partition");

    let summarized = frame
        .dispatch(
            &OpEnvelope::from_expr(&BatchOp::CountRows {
                alias: "n".to_string(),
            })
            .expect("envelope"),
        )
        .await
        .expect("dispatch");
    let collected = summarized.collect().await.expect("collect");
    assert_eq!(collected.num_rows(), frame.shard_count());
    assert_eq!(int_column(&collected, "n").iter().sum::<i64>(), 9);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_dataset_round_trips_without_shards() {
    let cluster = local_cluster(4).await;
    let batch = two_column_batch(vec![], vec![]);

    let frame = ShardFrame::partition(&cluster, &batch, PartitionOptions::grouped_by(["g"]))
        .await
        .expect("partition");
    assert_eq!(frame.shard_count(), 0);
    assert_eq!(frame.total_rows(), 0);

    let collected = frame.collect().await.expect("collect");
    assert_eq!(collected.num_rows(), 0);
    assert_eq!(collected.schema(), batch.schema());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn source_order_is_preserved_within_groups() {
    let cluster = local_cluster(2).await;
    // Interleaved groups with ascending values per group.
    let keys: Vec<i64> = (0..20).map(|i| i % 2).collect();
    let values: Vec<i64> = (0..20).collect();
    let batch = two_column_batch(keys, values);

    let frame = ShardFrame::partition(&cluster, &batch, PartitionOptions::grouped_by(["g"]))
        .await
        .expect("partition");
    let collected = frame.collect().await.expect("collect");

    let groups = int_column(&collected, "g");
    let vals = int_column(&collected, "v");
    for group in [0_i64, 1] {
        let per_group: Vec<i64> = groups
            .iter()
            .zip(&vals)
            .filter(|(g, _)| **g == group)
            .map(|(_, v)| *v)
            .collect();
        let mut sorted = per_group.clone();
        sorted.sort_unstable();
        assert_eq!(per_group, sorted, "group {group} lost source order");
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn frame_reports_balance_summary() {
    let cluster = local_cluster(3).await;
    let batch = two_column_batch((0..9).map(|i| i % 3).collect(), (0..9).collect());
    let frame = ShardFrame::partition(&cluster, &batch, PartitionOptions::grouped_by(["g"]))
        .await
        .expect("partition");

    assert_eq!(frame.node_count(), 3);
    assert_eq!(frame.grouping_keys(), ["g".to_string()]);
    let display = frame.to_string();
    assert!(display.contains("3 shards on 3 nodes"), "got: {display}");
    assert!(display.contains("9 rows"), "got: {display}");

    cluster.shutdown().await;
}
