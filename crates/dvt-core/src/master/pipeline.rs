//! Per-job pipeline: segment, dispatch, collect, concatenate, replicate.
//!
//! One task per job; each shard attempt runs as a child task owned by the
//! job's `JoinSet`, so aborting the job (demotion, shutdown) cancels every
//! in-flight shard RPC with it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::digest::digest_file;
use crate::job::{FailReason, JobStatus, Shard, ShardIndex};
use crate::retry::{classify_wire, AttemptDecision, ShardErrorKind};
use crate::storage::TempWriter;
use crate::wire::{Connection, Message};

use super::{replicate, schedule, MasterEngine};

/// How long a shard waits between scheduler polls when no worker is free.
const DISPATCH_POLL: Duration = Duration::from_millis(500);

#[derive(Debug)]
enum AttemptOutcome {
    Ready {
        index: ShardIndex,
    },
    Failed {
        index: ShardIndex,
        attempt: u32,
        kind: ShardErrorKind,
        detail: String,
    },
}

pub(super) async fn run_pipeline(engine: &Arc<MasterEngine>, job_id: &str) {
    if let Err((reason, detail)) = run_pipeline_inner(engine, job_id).await {
        tracing::warn!(job = job_id, reason = reason.as_str(), "{detail}");
        engine
            .board
            .set_status(job_id, JobStatus::Failed(reason), &detail);
    }
}

async fn run_pipeline_inner(
    engine: &Arc<MasterEngine>,
    job_id: &str,
) -> Result<(), (FailReason, String)> {
    let job = engine
        .board
        .get(job_id)
        .ok_or((FailReason::StorageError, "job record vanished".to_string()))?;

    // Segment.
    engine.board.set_status(job_id, JobStatus::Segmenting, "");
    let shard_dir = engine.paths.shard_dir(job_id);
    let shard_paths = engine
        .media
        .segment(&job.source_path, engine.cfg.segment_seconds, &shard_dir)
        .await
        .map_err(|e| (FailReason::MediaError, format!("segmentation failed: {e}")))?;
    let total = shard_paths.len();
    tracing::info!(job = job_id, shards = total, "segmented");
    engine.board.set_shards(
        job_id,
        shard_paths
            .into_iter()
            .enumerate()
            .map(|(i, p)| Shard::new(i as ShardIndex, p))
            .collect(),
    );
    engine.board.set_status(job_id, JobStatus::Dispatching, "");

    // Dispatch and collect. Attempt tasks deliver outcomes over the
    // channel; shards retry independently while others keep flowing.
    let mut attempts: JoinSet<()> = JoinSet::new();
    let (tx, mut rx) = mpsc::channel::<AttemptOutcome>(total.max(1));
    for index in 0..total as ShardIndex {
        spawn_attempt(
            &mut attempts,
            engine,
            job_id,
            index,
            1,
            Duration::ZERO,
            tx.clone(),
        );
    }
    engine.board.set_status(job_id, JobStatus::Processing, "");

    let mut ready = 0usize;
    while ready < total {
        let Some(outcome) = rx.recv().await else {
            return Err((
                FailReason::StorageError,
                "shard attempt channel closed".to_string(),
            ));
        };
        match outcome {
            AttemptOutcome::Ready { index } => {
                ready += 1;
                tracing::debug!(job = job_id, shard = index, ready, total, "shard collected");
                if ready == 1 {
                    engine.board.set_status(job_id, JobStatus::Collecting, "");
                }
            }
            AttemptOutcome::Failed {
                index,
                attempt,
                kind,
                detail,
            } => {
                tracing::warn!(
                    job = job_id,
                    shard = index,
                    attempt,
                    ?kind,
                    "shard attempt failed: {detail}"
                );
                match engine.policy.decide(attempt, kind) {
                    AttemptDecision::NoRetry => {
                        return Err((
                            FailReason::ShardExhausted,
                            format!("shard {index} failed after {attempt} attempts: {detail}"),
                        ));
                    }
                    AttemptDecision::RetryAfter(delay) => {
                        match engine
                            .board
                            .retry_shard(job_id, index, engine.cfg.max_attempts)
                        {
                            Some(next_attempt) => {
                                spawn_attempt(
                                    &mut attempts,
                                    engine,
                                    job_id,
                                    index,
                                    next_attempt,
                                    delay,
                                    tx.clone(),
                                );
                            }
                            None => {
                                return Err((
                                    FailReason::ShardExhausted,
                                    format!(
                                        "shard {index} exhausted its attempt budget: {detail}"
                                    ),
                                ));
                            }
                        }
                    }
                }
            }
        }
    }
    attempts.abort_all();

    // Concatenate, strictly in segmentation order.
    engine.board.set_status(job_id, JobStatus::Concatenating, "");
    let job = engine
        .board
        .get(job_id)
        .ok_or((FailReason::StorageError, "job record vanished".to_string()))?;
    let mut inputs: Vec<PathBuf> = Vec::with_capacity(job.shards.len());
    for shard in &job.shards {
        match &shard.processed_path {
            Some(path) => inputs.push(path.clone()),
            None => {
                return Err((
                    FailReason::StorageError,
                    format!("shard {} ready but not collected", shard.index),
                ));
            }
        }
    }

    let final_path = engine.paths.final_artifact(job_id, job.format);
    let staging = final_path.with_file_name(format!("staging.{}", job.format.as_str()));
    engine
        .media
        .concatenate(&inputs, &staging)
        .await
        .map_err(|e| (FailReason::MediaError, format!("concatenation failed: {e}")))?;
    publish(&staging, &final_path)
        .await
        .map_err(|e| (FailReason::StorageError, format!("publish failed: {e:#}")))?;
    let checksum = digest_file(&final_path)
        .await
        .map_err(|e| (FailReason::StorageError, format!("checksum failed: {e}")))?;
    engine.board.complete(job_id, final_path.clone(), checksum.clone());
    tracing::info!(job = job_id, path = %final_path.display(), "job completed");

    // Replicate. The client may already retrieve from the local copy; the
    // job turns durable once a backup holds it.
    replicate::replicate_artifact(engine, job_id, &final_path, job.format, &checksum).await;
    Ok(())
}

/// fsync then atomically rename the staged concat output into place.
async fn publish(staging: &std::path::Path, final_path: &std::path::Path) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(staging).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(staging, final_path).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_attempt(
    attempts: &mut JoinSet<()>,
    engine: &Arc<MasterEngine>,
    job_id: &str,
    index: ShardIndex,
    attempt: u32,
    delay: Duration,
    tx: mpsc::Sender<AttemptOutcome>,
) {
    let engine = Arc::clone(engine);
    let job_id = job_id.to_string();
    attempts.spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = run_attempt(&engine, &job_id, index, attempt).await;
        let _ = tx.send(outcome).await;
    });
}

/// One shard attempt: pick a worker, stream the shard, await the ack, pull
/// the processed output. The whole interaction runs under the shard
/// deadline.
async fn run_attempt(
    engine: &Arc<MasterEngine>,
    job_id: &str,
    index: ShardIndex,
    attempt: u32,
) -> AttemptOutcome {
    let deadline = engine.cfg.shard_deadline();
    let wait_started = Instant::now();

    let worker = loop {
        let Some(job) = engine.board.get(job_id) else {
            return AttemptOutcome::Failed {
                index,
                attempt,
                kind: ShardErrorKind::Other,
                detail: "job record vanished".to_string(),
            };
        };
        let Some(shard) = job.shards.get(index as usize) else {
            return AttemptOutcome::Failed {
                index,
                attempt,
                kind: ShardErrorKind::Other,
                detail: format!("shard {index} out of range"),
            };
        };
        let candidates = engine.registry.eligible_workers(&engine.cfg);
        if let Some(worker) = schedule::choose_worker(
            &candidates,
            &shard.failed_workers,
            shard.pending_since.elapsed(),
            engine.cfg.starvation_threshold(),
        ) {
            break worker;
        }
        if wait_started.elapsed() >= deadline {
            return AttemptOutcome::Failed {
                index,
                attempt,
                kind: ShardErrorKind::Timeout,
                detail: "no eligible worker within the shard deadline".to_string(),
            };
        }
        tokio::time::sleep(DISPATCH_POLL).await;
    };

    engine.board.assign_shard(job_id, index, &worker);
    engine.registry.inc_in_flight(&worker);
    tracing::debug!(job = job_id, shard = index, attempt, worker = %worker, "dispatching shard");

    let result = tokio::time::timeout(
        deadline,
        dispatch_and_collect(engine, job_id, index, attempt, &worker),
    )
    .await;
    engine.registry.dec_in_flight(&worker);

    match result {
        Ok(Ok(())) => AttemptOutcome::Ready { index },
        Ok(Err((kind, detail))) => AttemptOutcome::Failed {
            index,
            attempt,
            kind,
            detail,
        },
        Err(_) => AttemptOutcome::Failed {
            index,
            attempt,
            kind: ShardErrorKind::Timeout,
            detail: format!("shard deadline of {deadline:?} exceeded on {worker}"),
        },
    }
}

async fn dispatch_and_collect(
    engine: &Arc<MasterEngine>,
    job_id: &str,
    index: ShardIndex,
    attempt: u32,
    worker: &str,
) -> Result<(), (ShardErrorKind, String)> {
    let job = engine
        .board
        .get(job_id)
        .ok_or((ShardErrorKind::Other, "job record vanished".to_string()))?;
    let shard = job
        .shards
        .get(index as usize)
        .ok_or((ShardErrorKind::Other, format!("shard {index} out of range")))?;
    let wire_err = |e: crate::wire::WireError| (classify_wire(&e), e.to_string());

    // The reply waits on the worker's transcode, so this connection's idle
    // timeout is the shard deadline, not the stream idle timeout.
    let mut conn = Connection::connect(worker, engine.cfg.shard_deadline())
        .await
        .map_err(wire_err)?;
    conn.send(&Message::ProcessShard {
        job_id: job_id.to_string(),
        shard: index,
        attempt,
        width: job.width,
        height: job.height,
        format: job.format.as_str().to_string(),
    })
    .await
    .map_err(wire_err)?;
    conn.send_file(&shard.src_path).await.map_err(wire_err)?;

    match conn.recv().await.map_err(wire_err)? {
        Message::ShardReply { ok: true, .. } => {}
        Message::ShardReply { ok: false, message, .. } => {
            return Err((ShardErrorKind::WorkerReported, message));
        }
        other => {
            return Err((
                ShardErrorKind::WorkerReported,
                format!("unexpected reply to shard dispatch: {other:?}"),
            ));
        }
    }

    // Pull the processed shard with a fresh streaming connection.
    let mut pull = Connection::connect(worker, engine.cfg.stream_idle_timeout())
        .await
        .map_err(wire_err)?;
    pull.send(&Message::RequestShard {
        job_id: job_id.to_string(),
        shard: index,
        attempt,
    })
    .await
    .map_err(wire_err)?;
    match pull.recv().await.map_err(wire_err)? {
        Message::RetrieveReply { ok: true, .. } => {}
        Message::RetrieveReply { ok: false, message } => {
            return Err((ShardErrorKind::WorkerReported, message));
        }
        other => {
            return Err((
                ShardErrorKind::WorkerReported,
                format!("unexpected reply to shard pull: {other:?}"),
            ));
        }
    }

    let processed_path = engine.paths.processed_shard(job_id, index, job.format);
    let mut writer = TempWriter::create(&processed_path)
        .await
        .map_err(|e| (ShardErrorKind::Other, format!("processed store: {e:#}")))?;
    pull.recv_stream(writer.file_mut()).await.map_err(wire_err)?;
    let processed_path = writer
        .finalize()
        .await
        .map_err(|e| (ShardErrorKind::Other, format!("processed publish: {e:#}")))?;

    engine
        .board
        .report_shard_status(job_id, index, attempt, crate::job::ShardStatus::Ready, "");
    engine.board.shard_collected(job_id, index, processed_path);
    Ok(())
}
