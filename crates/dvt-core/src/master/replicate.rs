//! Replication fan-out and post-election restore.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::digest::digest_file;
use crate::media::VideoFormat;
use crate::storage::TempWriter;
use crate::wire::{Connection, Message};

use super::MasterEngine;

/// Stream the final artifact to every configured backup. The client's view
/// is unaffected (retrieval already serves the local copy); the job is
/// marked durable once at least one backup acked, or immediately when the
/// local store is configured as durable.
pub(super) async fn replicate_artifact(
    engine: &Arc<MasterEngine>,
    job_id: &str,
    final_path: &Path,
    format: VideoFormat,
    checksum: &str,
) {
    let mut acked = 0usize;
    for addr in &engine.cfg.backups {
        if addr == &engine.self_addr {
            continue;
        }
        let mut sent = send_replica(engine, addr, job_id, final_path, format, checksum).await;
        if sent.is_err() {
            // One re-send covers a rejected (corrupt) receipt.
            sent = send_replica(engine, addr, job_id, final_path, format, checksum).await;
        }
        match sent {
            Ok(()) => {
                tracing::info!(job = job_id, backup = %addr, "replica stored");
                acked += 1;
            }
            Err(err) => {
                tracing::warn!(job = job_id, backup = %addr, "replication failed: {err:#}");
            }
        }
    }

    if acked > 0 || engine.cfg.local_store_durable || engine.cfg.backups.is_empty() {
        engine.board.mark_durable(job_id);
    } else {
        tracing::warn!(job = job_id, "artifact not yet durable: no backup reachable");
    }
}

async fn send_replica(
    engine: &Arc<MasterEngine>,
    addr: &str,
    job_id: &str,
    final_path: &Path,
    format: VideoFormat,
    checksum: &str,
) -> Result<()> {
    let mut conn = Connection::connect(addr, engine.cfg.stream_idle_timeout())
        .await
        .context("connect backup")?;
    conn.send(&Message::ReceiveBackup {
        job_id: job_id.to_string(),
        format: format.as_str().to_string(),
        checksum: checksum.to_string(),
    })
    .await?;
    conn.send_file(final_path).await?;
    match conn.recv().await? {
        Message::Ack { ok: true, .. } => Ok(()),
        Message::Ack { ok: false, message } => bail!("backup refused replica: {message}"),
        other => bail!("unexpected replication reply: {other:?}"),
    }
}

/// A newly elected master pulls replicas it lacks from every reachable
/// backup. Restored jobs surface as completed; jobs mid-flight at the old
/// master are gone and clients resubmit them.
pub async fn restore_from_backups(engine: &Arc<MasterEngine>, sources: &[String]) {
    for addr in sources {
        if addr == &engine.self_addr {
            continue;
        }
        let list = match crate::wire::request(
            addr,
            &Message::ListBackups,
            engine.cfg.stream_idle_timeout(),
        )
        .await
        {
            Ok(Message::BackupList { jobs }) => jobs,
            Ok(other) => {
                tracing::debug!(backup = %addr, "unexpected backup listing: {other:?}");
                continue;
            }
            Err(err) => {
                tracing::debug!(backup = %addr, "backup listing failed: {err}");
                continue;
            }
        };

        for entry in list {
            if engine.board.snapshot(&entry.job_id).is_some() {
                continue;
            }
            let Some(format) = VideoFormat::from_str(&entry.format) else {
                tracing::warn!(job = %entry.job_id, format = %entry.format, "replica with unknown format skipped");
                continue;
            };
            match pull_replica(engine, addr, &entry.job_id, format).await {
                Ok(()) => {
                    tracing::info!(job = %entry.job_id, backup = %addr, "artifact restored");
                }
                Err(err) => {
                    tracing::warn!(job = %entry.job_id, backup = %addr, "restore failed: {err:#}");
                }
            }
        }
    }
}

async fn pull_replica(
    engine: &Arc<MasterEngine>,
    addr: &str,
    job_id: &str,
    format: VideoFormat,
) -> Result<()> {
    let mut conn = Connection::connect(addr, engine.cfg.stream_idle_timeout())
        .await
        .context("connect backup")?;
    conn.send(&Message::SendBackup {
        job_id: job_id.to_string(),
    })
    .await?;
    match conn.recv().await? {
        Message::RetrieveReply { ok: true, .. } => {}
        Message::RetrieveReply { ok: false, message } => bail!("backup refused: {message}"),
        other => bail!("unexpected restore reply: {other:?}"),
    }

    let final_path = engine.paths.final_artifact(job_id, format);
    let mut writer = TempWriter::create(&final_path).await?;
    conn.recv_stream(writer.file_mut()).await?;
    let final_path = writer.finalize().await?;

    let checksum = digest_file(&final_path).await.ok();
    engine
        .board
        .insert_completed(job_id, format, final_path, checksum);
    Ok(())
}
