//! `dvt submit` – upload a source video and print the job id.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

use dvt_core::client;
use dvt_core::config::NodeConfig;

use crate::cli::master_addr;

pub async fn run(
    cfg: &NodeConfig,
    file: PathBuf,
    width: u32,
    height: u32,
    format: String,
    master: Option<String>,
    wait: bool,
) -> Result<()> {
    let master = master_addr(cfg, master)?;
    let timeout = cfg.stream_idle_timeout();

    let job_id = client::upload(&master, &file, width, height, &format, timeout).await?;
    println!("{job_id}");

    if wait {
        let status = client::wait_for_completion(
            &master,
            &job_id,
            Duration::from_secs(1),
            Duration::from_secs(3600),
        )
        .await?;
        println!("{status}");
    }
    Ok(())
}
