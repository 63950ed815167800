use std::env;
use std::sync::Arc;

use shf_cluster::{BatchOpEvaluator, NodeRuntime};
use shf_common::{ClusterConfig, NodeId};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32_or_default(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize_or_default(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let node = NodeId(env_u32_or_default("SHF_NODE_ID", 0));
    let bind = env_or_default("SHF_NODE_BIND", "127.0.0.1:0");
    let max_frame_bytes = env_usize_or_default(
        "SHF_NODE_MAX_FRAME_BYTES",
        ClusterConfig::default().max_frame_bytes,
    );

    let listener = TcpListener::bind(&bind).await?;
    let addr = listener.local_addr()?;
    // The launcher parses this line to find the ephemeral port.
    println!("shf-node {node} listening on {addr}");

    let (stream, peer) = listener.accept().await?;
    tracing::info!(node = %node, peer = %peer, operator = "NodeMain", "control connection accepted");
    let runtime = NodeRuntime::new(node, Arc::new(BatchOpEvaluator));
    runtime.serve(stream, max_frame_bytes).await?;
    Ok(())
}
