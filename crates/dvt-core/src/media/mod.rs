//! Media operations: segment, transcode, concatenate.
//!
//! The orchestration core never touches codec internals; it invokes these
//! three operations and relies on their contracts: run to completion or fail
//! with diagnostic text, write only to the given output path, never modify
//! inputs.

mod ffmpeg;

pub use ffmpeg::FfmpegExecutor;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Target container formats accepted at upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    Mp4,
    Mkv,
    Webm,
    Mov,
}

impl VideoFormat {
    /// Wire and extension spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            VideoFormat::Mp4 => "mp4",
            VideoFormat::Mkv => "mkv",
            VideoFormat::Webm => "webm",
            VideoFormat::Mov => "mov",
        }
    }

    /// Parses the wire spelling. Returns `None` for unsupported formats.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "mp4" => Some(VideoFormat::Mp4),
            "mkv" => Some(VideoFormat::Mkv),
            "webm" => Some(VideoFormat::Webm),
            "mov" => Some(VideoFormat::Mov),
            _ => None,
        }
    }

    /// Video codec used when encoding into this container.
    pub fn video_codec(self) -> &'static str {
        match self {
            VideoFormat::Mp4 | VideoFormat::Mkv | VideoFormat::Mov => "libx264",
            VideoFormat::Webm => "libvpx-vp9",
        }
    }

    /// Audio codec for containers that reject arbitrary audio streams.
    /// `None` means the source audio is stream-copied.
    pub fn forced_audio_codec(self) -> Option<&'static str> {
        match self {
            VideoFormat::Webm => Some("libopus"),
            _ => None,
        }
    }
}

/// Error from a media operation. `Tool` carries the exit status and a
/// bounded stderr tail for `ReportShardStatus` messages and logs.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media tool exited with {status}: {stderr_tail}")]
    Tool { status: i32, stderr_tail: String },
    #[error("media tool produced no output at {0}")]
    MissingOutput(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type MediaResult<T> = Result<T, MediaError>;

/// The three operations the orchestration core needs from the media tool.
///
/// Implementations must write only to caller-specified output paths and
/// leave inputs untouched. Tests substitute a deterministic byte-level
/// implementation so the cluster suites run without an ffmpeg install.
#[async_trait]
pub trait MediaExecutor: Send + Sync {
    /// Split `input` into contiguous shards of roughly `segment_seconds`
    /// each, written into `out_dir`. Returns the shard paths in playback
    /// order; their concatenation must be frame-exact with the input.
    async fn segment(
        &self,
        input: &Path,
        segment_seconds: u32,
        out_dir: &Path,
    ) -> MediaResult<Vec<PathBuf>>;

    /// Scale `input` to `width`x`height` and encode into `format` at
    /// `output`, copying audio where the container allows.
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        width: u32,
        height: u32,
        format: VideoFormat,
    ) -> MediaResult<()>;

    /// Stream-copy `inputs` (in order) into `output` without re-encoding,
    /// preserving timebases. Byte-deterministic given identical inputs.
    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> MediaResult<()>;
}
