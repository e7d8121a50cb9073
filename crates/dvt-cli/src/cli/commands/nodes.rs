//! `dvt nodes` – print the registry as one node sees it.

use anyhow::Result;

use dvt_core::client;
use dvt_core::config::NodeConfig;

use crate::cli::master_addr;

pub async fn run(cfg: &NodeConfig, addr: Option<String>) -> Result<()> {
    let addr = master_addr(cfg, addr)?;
    let stats = client::node_stats(&addr, cfg.stream_idle_timeout()).await?;
    if stats.is_empty() {
        println!("no known peers");
        return Ok(());
    }
    println!(
        "{:<24} {:<8} {:<8} {:>8} {:>12}",
        "ADDRESS", "ROLE", "LIVE", "SCORE", "SEEN(ms ago)"
    );
    for node in stats {
        println!(
            "{:<24} {:<8} {:<8} {:>8} {:>12}",
            node.addr,
            node.role,
            node.liveness,
            node.score
                .map(|s| format!("{s:.3}"))
                .unwrap_or_else(|| "-".to_string()),
            node.last_seen_ms_ago
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}
