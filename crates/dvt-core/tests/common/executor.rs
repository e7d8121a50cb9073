//! Deterministic byte-level media executor for cluster tests.
//!
//! Mirrors the real tool's contracts without an ffmpeg install: segmenting
//! splits bytes, transcoding prepends a parameter header, concatenation
//! joins bytes in order. Re-running any operation on the same inputs yields
//! identical outputs, and concatenating all shards of a segmented file
//! reconstructs the transformed source exactly.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dvt_core::media::{MediaError, MediaExecutor, MediaResult, VideoFormat};

/// Shard size for the byte splitter.
pub const SEGMENT_BYTES: usize = 8 * 1024;

pub struct ByteSplitExecutor {
    /// Fail this many transcodes before succeeding (failure injection).
    fail_transcodes: AtomicU32,
    /// Per-transcode delay, so kill-mid-job tests have a window to aim at.
    transcode_delay: Duration,
}

impl ByteSplitExecutor {
    pub fn new() -> Self {
        Self {
            fail_transcodes: AtomicU32::new(0),
            transcode_delay: Duration::ZERO,
        }
    }

    pub fn with_transcode_delay(delay: Duration) -> Self {
        Self {
            fail_transcodes: AtomicU32::new(0),
            transcode_delay: delay,
        }
    }

    pub fn fail_next_transcodes(&self, n: u32) {
        self.fail_transcodes.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.fail_transcodes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// The header a "transcode" prepends; tests recompute expected outputs
/// with the same function.
pub fn transcode_header(width: u32, height: u32, format: VideoFormat) -> Vec<u8> {
    format!("DVT[{width}x{height}:{}]", format.as_str()).into_bytes()
}

/// Expected final artifact for a source transcoded at the given parameters.
pub fn expected_final(source: &[u8], width: u32, height: u32, format: VideoFormat) -> Vec<u8> {
    let mut out = Vec::new();
    let chunks: Vec<&[u8]> = if source.is_empty() {
        vec![&[][..]]
    } else {
        source.chunks(SEGMENT_BYTES).collect()
    };
    for chunk in chunks {
        out.extend_from_slice(&transcode_header(width, height, format));
        out.extend_from_slice(chunk);
    }
    out
}

#[async_trait]
impl MediaExecutor for ByteSplitExecutor {
    async fn segment(
        &self,
        input: &Path,
        _segment_seconds: u32,
        out_dir: &Path,
    ) -> MediaResult<Vec<PathBuf>> {
        tokio::fs::create_dir_all(out_dir).await?;
        let bytes = tokio::fs::read(input).await?;
        let chunks: Vec<&[u8]> = if bytes.is_empty() {
            vec![&[][..]]
        } else {
            bytes.chunks(SEGMENT_BYTES).collect()
        };
        let mut paths = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let path = out_dir.join(format!("{i}.mp4"));
            tokio::fs::write(&path, chunk).await?;
            paths.push(path);
        }
        Ok(paths)
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        width: u32,
        height: u32,
        format: VideoFormat,
    ) -> MediaResult<()> {
        if !self.transcode_delay.is_zero() {
            tokio::time::sleep(self.transcode_delay).await;
        }
        if self.take_failure() {
            return Err(MediaError::Tool {
                status: 1,
                stderr_tail: "injected transcode failure".to_string(),
            });
        }
        let bytes = tokio::fs::read(input).await?;
        let mut out = transcode_header(width, height, format);
        out.extend_from_slice(&bytes);
        tokio::fs::write(output, out).await?;
        Ok(())
    }

    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> MediaResult<()> {
        let mut out = Vec::new();
        for input in inputs {
            out.extend_from_slice(&tokio::fs::read(input).await?);
        }
        tokio::fs::write(output, out).await?;
        Ok(())
    }
}
