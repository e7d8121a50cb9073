//! `dvt master` – run a master node until interrupted.

use anyhow::Result;
use std::path::PathBuf;

use dvt_core::config::{NodeConfig, NodeRole};
use dvt_core::node;

pub async fn run(
    mut cfg: NodeConfig,
    listen: Option<String>,
    backups: Vec<String>,
    peers: Vec<String>,
    data_dir: Option<PathBuf>,
) -> Result<()> {
    cfg.role = NodeRole::Master;
    if let Some(listen) = listen {
        cfg.listen_addr = listen;
    }
    if !backups.is_empty() {
        cfg.backups = backups;
    }
    if !peers.is_empty() {
        cfg.peers = peers;
    }
    if data_dir.is_some() {
        cfg.data_dir = data_dir;
    }

    let state = node::start_node(cfg).await?;
    println!("master listening on {}", state.self_addr);

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    state.shutdown();
    Ok(())
}
