//! Wire protocol between nodes: one JSON message per line over TCP, with
//! raw byte payloads following `Chunk` headers.
//!
//! Statuses and formats travel as strings for forward compatibility; the
//! in-memory representations are sum types. Streams are short-lived: one
//! connection per operation, closed when the operation finishes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Preferred payload chunk size for streamed files.
pub const CHUNK_SIZE: usize = 1024 * 1024;
/// Hard cap on a single chunk a peer may announce.
pub const MAX_CHUNK: u64 = 4 * 1024 * 1024;
/// Hard cap on one header line.
const MAX_LINE: u64 = 256 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection closed by peer")]
    Closed,
    #[error("idle timeout after {0:?}")]
    IdleTimeout(Duration),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("chunk of {0} bytes exceeds the {MAX_CHUNK} byte cap")]
    ChunkTooLarge(u64),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type WireResult<T> = Result<T, WireError>;

/// One replica a backup node holds, as reported by `ListBackups`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub job_id: String,
    pub format: String,
}

/// Registry row as reported by `GetNodeStats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStat {
    pub addr: String,
    pub role: String,
    pub liveness: String,
    pub score: Option<f64>,
    pub last_seen_ms_ago: Option<u64>,
}

/// Every message that crosses the wire. Tagged JSON, snake_case on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // -------- client <-> master --------
    UploadBegin {
        filename: String,
        width: u32,
        height: u32,
        format: String,
    },
    UploadReply {
        accepted: bool,
        job_id: Option<String>,
        message: String,
    },
    Status {
        job_id: String,
    },
    StatusReply {
        status: String,
        message: String,
    },
    Retrieve {
        job_id: String,
    },
    /// Also answers `RequestShard` and `SendBackup`; `ok: true` is followed
    /// by `Chunk`/`End` frames.
    RetrieveReply {
        ok: bool,
        message: String,
    },

    // -------- streaming primitives --------
    /// Followed by exactly `len` raw bytes on the same stream.
    Chunk {
        len: u64,
    },
    /// Terminates a chunk sequence; `total` is the byte count for sanity.
    End {
        total: u64,
    },

    // -------- worker -> master --------
    Register {
        addr: String,
        capacity: u32,
    },
    RegisterReply {
        ok: bool,
        master: Option<String>,
    },
    ReportScore {
        addr: String,
        score: f64,
    },
    ReportShardStatus {
        worker: String,
        job_id: String,
        shard: u32,
        attempt: u32,
        status: String,
        message: String,
    },
    Ack {
        ok: bool,
        message: String,
    },

    // -------- master -> worker --------
    /// Followed by `Chunk`/`End` frames carrying the source shard.
    ProcessShard {
        job_id: String,
        shard: u32,
        attempt: u32,
        width: u32,
        height: u32,
        format: String,
    },
    ShardReply {
        ok: bool,
        message: String,
        output_len: u64,
    },
    RequestShard {
        job_id: String,
        shard: u32,
        attempt: u32,
    },
    /// Followed by `Chunk`/`End` frames carrying the final artifact.
    ReceiveBackup {
        job_id: String,
        format: String,
        checksum: String,
    },
    SendBackup {
        job_id: String,
    },
    ListBackups,
    BackupList {
        jobs: Vec<BackupEntry>,
    },

    // -------- election / cluster --------
    RequestVote {
        term: u64,
        candidate: String,
    },
    VoteReply {
        term: u64,
        granted: bool,
    },
    AnnounceMaster {
        term: u64,
        master: String,
    },
    GetCurrentMaster,
    MasterReply {
        master: Option<String>,
        term: u64,
    },
    GetNodeStats,
    NodeStatsReply {
        nodes: Vec<NodeStat>,
    },
}

/// One node-to-node connection. Reads are bounded by the idle timeout; a
/// peer that stalls mid-stream fails the operation rather than wedging it.
pub struct Connection {
    reader: BufReader<tokio::io::Take<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    idle_timeout: Duration,
}

impl Connection {
    pub fn new(stream: TcpStream, idle_timeout: Duration) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            // The limit is re-armed per line read; see `recv`.
            reader: BufReader::new(read_half.take(MAX_LINE)),
            writer,
            idle_timeout,
        }
    }

    pub async fn connect(addr: &str, idle_timeout: Duration) -> WireResult<Self> {
        let stream = tokio::time::timeout(idle_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WireError::IdleTimeout(idle_timeout))??;
        Ok(Self::new(stream, idle_timeout))
    }

    pub async fn send(&mut self, msg: &Message) -> WireResult<()> {
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive the next message, or `None` on clean EOF between messages.
    pub async fn recv_opt(&mut self) -> WireResult<Option<Message>> {
        self.reader.get_mut().set_limit(MAX_LINE);
        let mut line = String::new();
        let n = tokio::time::timeout(self.idle_timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| WireError::IdleTimeout(self.idle_timeout))??;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(WireError::Protocol("empty message line".to_string()));
        }
        Ok(Some(serde_json::from_str(trimmed)?))
    }

    /// Receive the next message; EOF is an error (a reply was expected).
    pub async fn recv(&mut self) -> WireResult<Message> {
        self.recv_opt().await?.ok_or(WireError::Closed)
    }

    async fn read_exact_timed(&mut self, buf: &mut [u8]) -> WireResult<()> {
        self.reader.get_mut().set_limit(u64::MAX);
        tokio::time::timeout(self.idle_timeout, self.reader.read_exact(buf))
            .await
            .map_err(|_| WireError::IdleTimeout(self.idle_timeout))??;
        Ok(())
    }

    /// Stream a file as `Chunk`/`End` frames. Returns the byte count.
    pub async fn send_file(&mut self, path: &Path) -> WireResult<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.send(&Message::Chunk { len: n as u64 }).await?;
            self.writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        self.send(&Message::End { total }).await?;
        self.writer.flush().await?;
        Ok(total)
    }

    /// Stream an in-memory buffer as `Chunk`/`End` frames.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> WireResult<u64> {
        for chunk in bytes.chunks(CHUNK_SIZE) {
            self.send(&Message::Chunk {
                len: chunk.len() as u64,
            })
            .await?;
            self.writer.write_all(chunk).await?;
        }
        self.send(&Message::End {
            total: bytes.len() as u64,
        })
        .await?;
        self.writer.flush().await?;
        Ok(bytes.len() as u64)
    }

    /// Consume `Chunk`/`End` frames into `out`. Returns the byte count and
    /// verifies it against the sender's `End { total }`.
    pub async fn recv_stream(
        &mut self,
        out: &mut (impl tokio::io::AsyncWrite + Unpin),
    ) -> WireResult<u64> {
        let mut total = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match self.recv().await? {
                Message::Chunk { len } => {
                    if len > MAX_CHUNK {
                        return Err(WireError::ChunkTooLarge(len));
                    }
                    let mut remaining = len as usize;
                    while remaining > 0 {
                        let take = remaining.min(buf.len());
                        self.read_exact_timed(&mut buf[..take]).await?;
                        out.write_all(&buf[..take]).await?;
                        remaining -= take;
                    }
                    total += len;
                }
                Message::End { total: declared } => {
                    if declared != total {
                        return Err(WireError::Protocol(format!(
                            "stream ended at {total} bytes but peer declared {declared}"
                        )));
                    }
                    out.flush().await?;
                    return Ok(total);
                }
                other => {
                    return Err(WireError::Protocol(format!(
                        "expected chunk or end, got {other:?}"
                    )))
                }
            }
        }
    }
}

/// One-shot request/reply: connect, send, read a single reply.
pub async fn request(addr: &str, msg: &Message, timeout: Duration) -> WireResult<Message> {
    let mut conn = Connection::connect(addr, timeout).await?;
    conn.send(msg).await?;
    conn.recv().await
}

/// One-shot send with no reply expected (announcements, score reports).
pub async fn send_oneway(addr: &str, msg: &Message, timeout: Duration) -> WireResult<()> {
    let mut conn = Connection::connect(addr, timeout).await?;
    conn.send(msg).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const T: Duration = Duration::from_secs(2);

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        (
            Connection::new(server, T),
            Connection::new(client.await.unwrap(), T),
        )
    }

    #[tokio::test]
    async fn message_roundtrip() {
        let (mut server, mut client) = pair().await;
        client
            .send(&Message::Status {
                job_id: "clip".to_string(),
            })
            .await
            .unwrap();
        match server.recv().await.unwrap() {
            Message::Status { job_id } => assert_eq!(job_id, "clip"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunked_stream_roundtrip() {
        let (mut server, mut client) = pair().await;
        let payload: Vec<u8> = (0u8..=255).cycle().take(3 * CHUNK_SIZE + 17).collect();
        let expected = payload.clone();

        let send = tokio::spawn(async move {
            client.send_bytes(&payload).await.unwrap();
        });
        let mut received = Vec::new();
        let n = server.recv_stream(&mut received).await.unwrap();
        send.await.unwrap();

        assert_eq!(n as usize, expected.len());
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn mismatched_total_is_protocol_error() {
        let (mut server, mut client) = pair().await;
        client.send(&Message::Chunk { len: 3 }).await.unwrap();
        client.writer.write_all(b"abc").await.unwrap();
        client.send(&Message::End { total: 999 }).await.unwrap();

        let mut sink = Vec::new();
        let err = server.recv_stream(&mut sink).await.unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)), "{err}");
    }

    #[tokio::test]
    async fn oversized_chunk_rejected() {
        let (mut server, mut client) = pair().await;
        client
            .send(&Message::Chunk { len: MAX_CHUNK + 1 })
            .await
            .unwrap();
        let mut sink = Vec::new();
        let err = server.recv_stream(&mut sink).await.unwrap_err();
        assert!(matches!(err, WireError::ChunkTooLarge(_)));
    }

    #[tokio::test]
    async fn idle_timeout_fires() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _held = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the connection open without sending anything.
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });
        let mut conn = Connection::connect(&addr.to_string(), Duration::from_millis(100))
            .await
            .unwrap();
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, WireError::IdleTimeout(_)));
    }

    #[test]
    fn wire_spelling_is_snake_case_tagged() {
        let json = serde_json::to_string(&Message::ReportScore {
            addr: "w:1".to_string(),
            score: 0.25,
        })
        .unwrap();
        assert!(json.contains(r#""type":"report_score""#), "{json}");
    }
}
