//! Client-side operations against a master: upload, status, retrieve.
//!
//! Errors are split so callers can distinguish "you asked for something
//! invalid" from "the network let you down" from "the job itself failed";
//! the CLI maps these onto its exit codes.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::storage::TempWriter;
use crate::wire::{Connection, Message, NodeStat, WireError};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The master rejected the request (bad parameters, unknown job, wrong
    /// state). Not retryable.
    #[error("{0}")]
    Rejected(String),
    /// Transport-level failure.
    #[error(transparent)]
    Network(#[from] WireError),
    /// The job reached a failed terminal state.
    #[error("job failed: {0}")]
    JobFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Upload a source file for transcoding. Returns the job id.
pub async fn upload(
    master: &str,
    source: &Path,
    width: u32,
    height: u32,
    format: &str,
    timeout: Duration,
) -> ClientResult<String> {
    let filename = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ClientError::Rejected(format!("{} has no filename", source.display())))?;

    let mut conn = Connection::connect(master, timeout).await?;
    conn.send(&Message::UploadBegin {
        filename,
        width,
        height,
        format: format.to_string(),
    })
    .await?;
    let job_id = match conn.recv().await? {
        Message::UploadReply {
            accepted: true,
            job_id: Some(job_id),
            ..
        } => job_id,
        Message::UploadReply { message, .. } => return Err(ClientError::Rejected(message)),
        other => {
            return Err(ClientError::Network(WireError::Protocol(format!(
                "unexpected upload reply: {other:?}"
            ))))
        }
    };

    conn.send_file(source).await?;
    match conn.recv().await? {
        Message::Ack { ok: true, .. } => Ok(job_id),
        Message::Ack { message, .. } => Err(ClientError::Rejected(message)),
        other => Err(ClientError::Network(WireError::Protocol(format!(
            "unexpected upload ack: {other:?}"
        )))),
    }
}

/// Snapshot of a job's `{status, message}`.
pub async fn status(master: &str, job_id: &str, timeout: Duration) -> ClientResult<(String, String)> {
    let reply = crate::wire::request(
        master,
        &Message::Status {
            job_id: job_id.to_string(),
        },
        timeout,
    )
    .await?;
    match reply {
        Message::StatusReply { status, message } => Ok((status, message)),
        other => Err(ClientError::Network(WireError::Protocol(format!(
            "unexpected status reply: {other:?}"
        )))),
    }
}

/// Download the final artifact of a completed job into `dest`.
pub async fn retrieve(
    master: &str,
    job_id: &str,
    dest: &Path,
    timeout: Duration,
) -> ClientResult<u64> {
    let mut conn = Connection::connect(master, timeout).await?;
    conn.send(&Message::Retrieve {
        job_id: job_id.to_string(),
    })
    .await?;
    match conn.recv().await? {
        Message::RetrieveReply { ok: true, .. } => {}
        Message::RetrieveReply { message, .. } => return Err(ClientError::Rejected(message)),
        other => {
            return Err(ClientError::Network(WireError::Protocol(format!(
                "unexpected retrieve reply: {other:?}"
            ))))
        }
    }

    let mut writer = TempWriter::create(dest)
        .await
        .map_err(|e| ClientError::Rejected(format!("cannot write {}: {e:#}", dest.display())))?;
    let n = conn.recv_stream(writer.file_mut()).await?;
    writer
        .finalize()
        .await
        .map_err(|e| ClientError::Rejected(format!("cannot publish {}: {e:#}", dest.display())))?;
    Ok(n)
}

/// Poll status until the job reaches a terminal state or `deadline` passes.
/// Returns the final status string on completion.
pub async fn wait_for_completion(
    master: &str,
    job_id: &str,
    poll: Duration,
    deadline: Duration,
) -> ClientResult<String> {
    let started = std::time::Instant::now();
    loop {
        let (state, message) = status(master, job_id, poll.max(Duration::from_secs(1))).await?;
        if state == "completed" {
            return Ok(state);
        }
        if state.starts_with("failed:") {
            return Err(ClientError::JobFailed(format!("{state}: {message}")));
        }
        if state == "not_found" {
            return Err(ClientError::Rejected(message));
        }
        if started.elapsed() > deadline {
            return Err(ClientError::JobFailed(format!(
                "timed out in state {state} after {deadline:?}"
            )));
        }
        tokio::time::sleep(poll).await;
    }
}

/// Who a node currently believes is master.
pub async fn current_master(
    addr: &str,
    timeout: Duration,
) -> ClientResult<(Option<String>, u64)> {
    match crate::wire::request(addr, &Message::GetCurrentMaster, timeout).await? {
        Message::MasterReply { master, term } => Ok((master, term)),
        other => Err(ClientError::Network(WireError::Protocol(format!(
            "unexpected master reply: {other:?}"
        )))),
    }
}

/// Registry snapshot from a node.
pub async fn node_stats(addr: &str, timeout: Duration) -> ClientResult<Vec<NodeStat>> {
    match crate::wire::request(addr, &Message::GetNodeStats, timeout).await? {
        Message::NodeStatsReply { nodes } => Ok(nodes),
        other => Err(ClientError::Network(WireError::Protocol(format!(
            "unexpected stats reply: {other:?}"
        )))),
    }
}
