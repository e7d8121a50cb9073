//! `dvt fetch` – download a completed job's artifact.

use anyhow::Result;
use std::path::PathBuf;

use dvt_core::client;
use dvt_core::config::NodeConfig;

use crate::cli::master_addr;

pub async fn run(
    cfg: &NodeConfig,
    job_id: String,
    output: PathBuf,
    master: Option<String>,
) -> Result<()> {
    let master = master_addr(cfg, master)?;
    let bytes = client::retrieve(&master, &job_id, &output, cfg.stream_idle_timeout()).await?;
    println!("{} ({bytes} bytes)", output.display());
    Ok(())
}
