//! `dvt status` – print a job's `{status, message}` snapshot.

use anyhow::Result;

use dvt_core::client;
use dvt_core::config::NodeConfig;

use crate::cli::master_addr;

pub async fn run(cfg: &NodeConfig, job_id: String, master: Option<String>) -> Result<()> {
    let master = master_addr(cfg, master)?;
    let (status, message) = client::status(&master, &job_id, cfg.stream_idle_timeout()).await?;
    if message.is_empty() {
        println!("{status}");
    } else {
        println!("{status}  {message}");
    }
    Ok(())
}
