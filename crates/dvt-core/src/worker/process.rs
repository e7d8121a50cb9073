//! Worker-side RPC handlers: shard processing, shard serving, backup store.

use std::sync::Arc;

use crate::digest::HashingWriter;
use crate::job::ShardStatus;
use crate::media::VideoFormat;
use crate::storage::TempWriter;
use crate::wire::{Connection, Message, WireResult};

use super::WorkerEngine;

/// Best-effort status report to the current master. The processing reply
/// travels on the `ProcessShard` connection; these reports keep the board
/// current even if that connection dies.
async fn report_status(
    engine: &WorkerEngine,
    job_id: &str,
    shard: u32,
    attempt: u32,
    status: ShardStatus,
    message: &str,
) {
    let Some(master) = engine.election.known_master() else {
        return;
    };
    if master == engine.self_addr {
        return;
    }
    let msg = Message::ReportShardStatus {
        worker: engine.self_addr.clone(),
        job_id: job_id.to_string(),
        shard,
        attempt,
        status: status.as_str().to_string(),
        message: message.to_string(),
    };
    if let Err(err) = crate::wire::request(&master, &msg, engine.cfg.stream_idle_timeout()).await {
        tracing::debug!(job = job_id, shard, "shard status report failed: {err}");
    }
}

/// `ProcessShard`: receive the source shard, transcode, store, ack.
pub async fn handle_process_shard(
    engine: &Arc<WorkerEngine>,
    conn: &mut Connection,
    job_id: String,
    shard: u32,
    attempt: u32,
    width: u32,
    height: u32,
    format: String,
) -> WireResult<()> {
    let Some(format) = VideoFormat::from_str(&format) else {
        return conn
            .send(&Message::ShardReply {
                ok: false,
                message: format!("unsupported format {format}"),
                output_len: 0,
            })
            .await;
    };

    // Receive the shard before taking any slot: the master's stream must
    // not stall behind another job's transcode.
    let in_path = engine.paths.worker_shard_in(&job_id, shard, attempt);
    let mut writer = match TempWriter::create(&in_path).await {
        Ok(w) => w,
        Err(err) => {
            return conn
                .send(&Message::ShardReply {
                    ok: false,
                    message: format!("scratch unavailable: {err:#}"),
                    output_len: 0,
                })
                .await;
        }
    };
    if let Err(err) = conn.recv_stream(writer.file_mut()).await {
        let part = writer.abandon();
        tracing::warn!(job = %job_id, shard, part = %part.display(), "shard receive failed: {err}");
        return Err(err);
    }
    let in_path = match writer.finalize().await {
        Ok(p) => p,
        Err(err) => {
            return conn
                .send(&Message::ShardReply {
                    ok: false,
                    message: format!("scratch publish failed: {err:#}"),
                    output_len: 0,
                })
                .await;
        }
    };

    // Cross-job parallelism is capped; shards of one job run sequentially.
    let permit = match engine.capacity.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
            return conn
                .send(&Message::ShardReply {
                    ok: false,
                    message: "worker shutting down".to_string(),
                    output_len: 0,
                })
                .await;
        }
    };
    let job_lock = engine.job_lock(&job_id);
    let _job_guard = job_lock.lock().await;

    report_status(engine, &job_id, shard, attempt, ShardStatus::Processing, "").await;
    tracing::info!(job = %job_id, shard, attempt, width, height, "transcoding shard");

    let out_path = engine.paths.worker_shard_out(&job_id, shard, attempt, format);
    if let Some(parent) = out_path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let result = engine
        .media
        .transcode(&in_path, &out_path, width, height, format)
        .await;
    drop(permit);

    match result {
        Ok(()) => {
            let output_len = tokio::fs::metadata(&out_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            engine.store_output((job_id.clone(), shard, attempt), out_path);
            report_status(engine, &job_id, shard, attempt, ShardStatus::Ready, "").await;
            conn.send(&Message::ShardReply {
                ok: true,
                message: String::new(),
                output_len,
            })
            .await
        }
        Err(err) => {
            let message = format!("transcode failed: {err}");
            tracing::warn!(job = %job_id, shard, attempt, "{message}");
            report_status(engine, &job_id, shard, attempt, ShardStatus::Failed, &message).await;
            conn.send(&Message::ShardReply {
                ok: false,
                message,
                output_len: 0,
            })
            .await
        }
    }
}

/// `RequestShard`: stream a stored transcode output back to the master.
pub async fn handle_request_shard(
    engine: &Arc<WorkerEngine>,
    conn: &mut Connection,
    job_id: String,
    shard: u32,
    attempt: u32,
) -> WireResult<()> {
    match engine.output_for(&(job_id.clone(), shard, attempt)) {
        Some(path) if path.exists() => {
            conn.send(&Message::RetrieveReply {
                ok: true,
                message: String::new(),
            })
            .await?;
            conn.send_file(&path).await?;
            Ok(())
        }
        _ => {
            conn.send(&Message::RetrieveReply {
                ok: false,
                message: format!("no output for shard {shard} attempt {attempt}"),
            })
            .await
        }
    }
}

/// `ReceiveBackup`: durably store a replicated artifact, verifying its
/// checksum before publication.
pub async fn handle_receive_backup(
    engine: &Arc<WorkerEngine>,
    conn: &mut Connection,
    job_id: String,
    format: String,
    checksum: String,
) -> WireResult<()> {
    let Some(format) = VideoFormat::from_str(&format) else {
        return conn
            .send(&Message::Ack {
                ok: false,
                message: "unsupported format".to_string(),
            })
            .await;
    };

    let final_path = engine.paths.backup_artifact(&job_id, format);
    let mut writer = match TempWriter::create(&final_path).await {
        Ok(w) => w,
        Err(err) => {
            return conn
                .send(&Message::Ack {
                    ok: false,
                    message: format!("backup store unavailable: {err:#}"),
                })
                .await;
        }
    };
    // Hash in-stream: the digest covers exactly the bytes that landed in
    // the temp file, with no re-read before verification.
    let mut hashing = HashingWriter::new(writer.file_mut());
    conn.recv_stream(&mut hashing).await?;
    let received = hashing.digest();

    if received != checksum {
        let part = writer.abandon();
        let _ = tokio::fs::remove_file(&part).await;
        tracing::warn!(job = %job_id, "rejected corrupt replica");
        return conn
            .send(&Message::Ack {
                ok: false,
                message: "checksum mismatch".to_string(),
            })
            .await;
    }

    match writer.finalize().await {
        Ok(path) => {
            tracing::info!(job = %job_id, path = %path.display(), "stored backup replica");
            conn.send(&Message::Ack {
                ok: true,
                message: String::new(),
            })
            .await
        }
        Err(err) => {
            conn.send(&Message::Ack {
                ok: false,
                message: format!("backup publish failed: {err:#}"),
            })
            .await
        }
    }
}

/// `SendBackup`: stream a stored replica to a (newly elected) master.
pub async fn handle_send_backup(
    engine: &Arc<WorkerEngine>,
    conn: &mut Connection,
    job_id: String,
) -> WireResult<()> {
    let replica = engine
        .paths
        .list_backups()
        .into_iter()
        .find(|(id, _, _)| *id == job_id);
    match replica {
        Some((_, path, _)) => {
            conn.send(&Message::RetrieveReply {
                ok: true,
                message: String::new(),
            })
            .await?;
            conn.send_file(&path).await?;
            Ok(())
        }
        None => {
            conn.send(&Message::RetrieveReply {
                ok: false,
                message: format!("no replica for {job_id}"),
            })
            .await
        }
    }
}

/// `ListBackups`: replicas this node holds, with their formats.
pub async fn handle_list_backups(
    engine: &Arc<WorkerEngine>,
    conn: &mut Connection,
) -> WireResult<()> {
    let jobs = engine
        .paths
        .list_backups()
        .into_iter()
        .map(|(job_id, _, format)| crate::wire::BackupEntry {
            job_id,
            format: format.as_str().to_string(),
        })
        .collect();
    conn.send(&Message::BackupList { jobs }).await
}
