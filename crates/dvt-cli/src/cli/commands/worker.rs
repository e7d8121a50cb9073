//! `dvt worker` – run a worker node until interrupted.

use anyhow::Result;
use std::path::PathBuf;

use dvt_core::config::{NodeConfig, NodeRole};
use dvt_core::node;

pub async fn run(
    mut cfg: NodeConfig,
    listen: Option<String>,
    master: Option<String>,
    peers: Vec<String>,
    data_dir: Option<PathBuf>,
    capacity: Option<usize>,
) -> Result<()> {
    cfg.role = NodeRole::Worker;
    if let Some(listen) = listen {
        cfg.listen_addr = listen;
    }
    if master.is_some() {
        cfg.master_addr = master;
    }
    if !peers.is_empty() {
        cfg.peers = peers;
    }
    if data_dir.is_some() {
        cfg.data_dir = data_dir;
    }
    if let Some(capacity) = capacity {
        cfg.worker_capacity = capacity;
    }

    let state = node::start_node(cfg).await?;
    println!("worker listening on {}", state.self_addr);

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    state.shutdown();
    Ok(())
}
