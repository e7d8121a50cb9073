use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

/// Top-level CLI for the DVT distributed transcoding service.
#[derive(Debug, Parser)]
#[command(name = "dvt")]
#[command(about = "DVT: distributed video transcoding service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run a master node.
    Master {
        /// Listen address (host:port). Overrides the config file.
        #[arg(long)]
        listen: Option<String>,

        /// Backup node address; repeat for more than one.
        #[arg(long = "backup")]
        backups: Vec<String>,

        /// Peer address for elections; repeat for more than one.
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Data root for shards and artifacts.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Run a worker node.
    Worker {
        /// Listen address (host:port). Overrides the config file.
        #[arg(long)]
        listen: Option<String>,

        /// Address of the current master.
        #[arg(long)]
        master: Option<String>,

        /// Peer address for elections; repeat for more than one.
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Data root for scratch and the backup store.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Shards processed concurrently across jobs.
        #[arg(long)]
        capacity: Option<usize>,
    },

    /// Submit a video for transcoding.
    Submit {
        /// Source video file.
        file: PathBuf,

        /// Target width in pixels.
        #[arg(long)]
        width: u32,

        /// Target height in pixels.
        #[arg(long)]
        height: u32,

        /// Target container format (mp4, mkv, webm, mov).
        #[arg(long)]
        format: String,

        /// Master address.
        #[arg(long)]
        master: Option<String>,

        /// Block until the job completes (or fails).
        #[arg(long)]
        wait: bool,
    },

    /// Show a job's status.
    Status {
        /// Job identifier (printed by submit).
        job_id: String,

        /// Master address.
        #[arg(long)]
        master: Option<String>,
    },

    /// Download the transcoded result of a completed job.
    Fetch {
        /// Job identifier.
        job_id: String,

        /// Where to write the result.
        #[arg(long, short)]
        output: PathBuf,

        /// Master address.
        #[arg(long)]
        master: Option<String>,
    },

    /// Show the cluster registry as one node sees it.
    Nodes {
        /// Node to ask; defaults to the configured master.
        #[arg(long)]
        addr: Option<String>,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = dvt_core::config::load_or_init()?;
        tracing::debug!(?cfg, "config loaded");

        match cli.command {
            CliCommand::Master {
                listen,
                backups,
                peers,
                data_dir,
            } => commands::master::run(cfg, listen, backups, peers, data_dir).await,
            CliCommand::Worker {
                listen,
                master,
                peers,
                data_dir,
                capacity,
            } => commands::worker::run(cfg, listen, master, peers, data_dir, capacity).await,
            CliCommand::Submit {
                file,
                width,
                height,
                format,
                master,
                wait,
            } => commands::submit::run(&cfg, file, width, height, format, master, wait).await,
            CliCommand::Status { job_id, master } => {
                commands::status::run(&cfg, job_id, master).await
            }
            CliCommand::Fetch {
                job_id,
                output,
                master,
            } => commands::fetch::run(&cfg, job_id, output, master).await,
            CliCommand::Nodes { addr } => commands::nodes::run(&cfg, addr).await,
        }
    }
}

/// Resolve the master address from a flag or the config file.
pub(crate) fn master_addr(
    cfg: &dvt_core::config::NodeConfig,
    flag: Option<String>,
) -> Result<String> {
    flag.or_else(|| cfg.master_addr.clone()).ok_or_else(|| {
        anyhow::anyhow!("no master address: pass --master or set master_addr in the config")
    })
}
