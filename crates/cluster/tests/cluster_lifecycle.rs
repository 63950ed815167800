use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;
use shf_cluster::{
    BatchOp, BatchOpEvaluator, BindingEnv, Cluster, ClusterContext, ExprEvaluator, LaunchedNode,
    LocalLauncher, NodeLauncher, OpEnvelope,
};
use shf_common::{ClusterConfig, NodeId, ShfError};

fn config(node_count: usize) -> ClusterConfig {
    ClusterConfig {
        node_count,
        ..ClusterConfig::default()
    }
}

fn from_value_op(binding: &str, column: &str) -> OpEnvelope {
    OpEnvelope::from_expr(&BatchOp::FromValue {
        binding: binding.to_string(),
        column: column.to_string(),
    })
    .expect("envelope")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn assign_each_then_assign_expr_binds_per_node_values() {
    let cluster = Cluster::create(config(3), &LocalLauncher::new())
        .await
        .expect("cluster");

    let wrong_arity = cluster
        .assign_each("path", &[json!("only-one")])
        .await
        .expect_err("arity mismatch must fail");
    assert!(matches!(wrong_arity, ShfError::ClusterLifecycle(_)));

    cluster
        .assign_each("path", &[json!("a.csv"), json!("b.csv"), json!("c.csv")])
        .await
        .expect("assign_each");

    let rows = cluster
        .assign_expr("seed", &from_value_op("path", "p"))
        .await
        .expect("assign_expr");
    assert_eq!(rows, vec![1, 1, 1]);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn load_capability_invokes_evaluator_once_per_node() {
    struct CountingEvaluator {
        inner: BatchOpEvaluator,
        loads: Arc<AtomicUsize>,
    }

    impl ExprEvaluator for CountingEvaluator {
        fn evaluate(
            &self,
            node: NodeId,
            input: Option<&arrow::record_batch::RecordBatch>,
            op: &OpEnvelope,
            env: &BindingEnv<'_>,
        ) -> shf_common::Result<arrow::record_batch::RecordBatch> {
            self.inner.evaluate(node, input, op, env)
        }

        fn load_capability(&self, _node: NodeId, _name: &str) -> shf_common::Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let loads = Arc::new(AtomicUsize::new(0));
    let loads_for_factory = Arc::clone(&loads);
    let launcher = LocalLauncher::with_evaluators(move |_| {
        Arc::new(CountingEvaluator {
            inner: BatchOpEvaluator,
            loads: Arc::clone(&loads_for_factory),
        })
    });
    let cluster = Cluster::create(config(2), &launcher).await.expect("cluster");

    cluster.load_capability("stats").await.expect("first load");
    cluster.load_capability("stats").await.expect("second load");
    assert_eq!(loads.load(Ordering::SeqCst), 2, "one load per node, not per call");

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_is_idempotent_and_blocks_further_calls() {
    let cluster = Cluster::create(config(2), &LocalLauncher::new())
        .await
        .expect("cluster");

    cluster.shutdown().await;
    cluster.shutdown().await;

    let err = cluster
        .assign_each("x", &[json!(1), json!(2)])
        .await
        .expect_err("must fail after shutdown");
    assert!(matches!(err, ShfError::ClusterLifecycle(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_launch_failure_yields_no_cluster() {
    struct FailingLauncher {
        inner: LocalLauncher,
        fail_node: NodeId,
    }

    #[async_trait]
    impl NodeLauncher for FailingLauncher {
        async fn launch(
            &self,
            node: NodeId,
            config: &ClusterConfig,
        ) -> shf_common::Result<LaunchedNode> {
            if node == self.fail_node {
                return Err(ShfError::NodeUnavailable {
                    node,
                    reason: "simulated launch failure".to_string(),
                });
            }
            self.inner.launch(node, config).await
        }
    }

    let launcher = FailingLauncher {
        inner: LocalLauncher::new(),
        fail_node: NodeId(1),
    };
    let err = Cluster::create(config(3), &launcher)
        .await
        .expect_err("create must fail");
    match err {
        ShfError::NodeUnavailable { node, .. } => assert_eq!(node, NodeId(1)),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn default_cluster_slot_is_overwritten_on_each_set() {
    let ctx = ClusterContext::new();
    assert!(ctx.default_cluster().is_none());
    assert!(matches!(
        ctx.require_default().expect_err("empty slot"),
        ShfError::ClusterLifecycle(_)
    ));

    let first = Cluster::create(config(1), &LocalLauncher::new())
        .await
        .expect("first cluster");
    let second = Cluster::create(config(2), &LocalLauncher::new())
        .await
        .expect("second cluster");

    assert!(ctx.set_default(first).is_none());
    let replaced = ctx.set_default(second).expect("previous default");
    assert_eq!(replaced.node_count(), 1);
    assert_eq!(ctx.require_default().expect("default").node_count(), 2);

    let cleared = ctx.clear().expect("cleared default");
    cleared.shutdown().await;
    replaced.shutdown().await;
    assert!(ctx.default_cluster().is_none());
}
