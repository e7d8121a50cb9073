//! Media executor backed by the ffmpeg binary.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::{MediaError, MediaExecutor, MediaResult, VideoFormat};

/// How much stderr to keep when a tool invocation fails.
const STDERR_TAIL: usize = 2048;

/// Invokes `ffmpeg` as a subprocess. The binary path is configurable so
/// deployments can pin a specific build.
pub struct FfmpegExecutor {
    ffmpeg_path: String,
}

impl FfmpegExecutor {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> MediaResult<()> {
        tracing::debug!(tool = %self.ffmpeg_path, ?args, "invoking media tool");
        let output = Command::new(&self.ffmpeg_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
        let mut start = tail_start;
        while start < stderr.len() && !stderr.is_char_boundary(start) {
            start += 1;
        }
        Err(MediaError::Tool {
            status: output.status.code().unwrap_or(-1),
            stderr_tail: stderr[start..].to_string(),
        })
    }
}

#[async_trait]
impl MediaExecutor for FfmpegExecutor {
    async fn segment(
        &self,
        input: &Path,
        segment_seconds: u32,
        out_dir: &Path,
    ) -> MediaResult<Vec<PathBuf>> {
        tokio::fs::create_dir_all(out_dir).await?;
        let pattern = out_dir.join("%d.mp4");
        let keyframes = format!("expr:gte(t,n_forced*{segment_seconds})");
        let seconds = segment_seconds.to_string();
        self.run(&[
            "-hide_banner",
            "-y",
            "-i",
            &input.to_string_lossy(),
            "-force_key_frames",
            &keyframes,
            "-f",
            "segment",
            "-segment_time",
            &seconds,
            "-reset_timestamps",
            "1",
            &pattern.to_string_lossy(),
        ])
        .await?;

        // The segment muxer numbers outputs 0..N; collect until the first gap.
        let mut shards = Vec::new();
        loop {
            let path = out_dir.join(format!("{}.mp4", shards.len()));
            if !path.exists() {
                break;
            }
            shards.push(path);
        }
        if shards.is_empty() {
            return Err(MediaError::MissingOutput(out_dir.to_path_buf()));
        }
        Ok(shards)
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        width: u32,
        height: u32,
        format: VideoFormat,
    ) -> MediaResult<()> {
        let scale = format!("scale={width}:{height}");
        let mut args = vec![
            "-hide_banner".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-vf".to_string(),
            scale,
            "-c:v".to_string(),
            format.video_codec().to_string(),
        ];
        match format.forced_audio_codec() {
            Some(codec) => args.extend(["-c:a".to_string(), codec.to_string()]),
            None => args.extend(["-c:a".to_string(), "copy".to_string()]),
        }
        args.push(output.to_string_lossy().into_owned());
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&refs).await?;

        if !output.exists() {
            return Err(MediaError::MissingOutput(output.to_path_buf()));
        }
        Ok(())
    }

    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> MediaResult<()> {
        // Concat demuxer wants a manifest; single quotes in paths are escaped
        // per its quoting rules.
        let manifest_path = output.with_extension("concat.txt");
        let mut manifest = String::new();
        for input in inputs {
            let escaped = input.to_string_lossy().replace('\'', "'\\''");
            manifest.push_str(&format!("file '{}'\n", escaped));
        }
        tokio::fs::write(&manifest_path, manifest).await?;

        let result = self
            .run(&[
                "-hide_banner",
                "-y",
                "-f",
                "concat",
                "-safe",
                "0",
                "-i",
                &manifest_path.to_string_lossy(),
                "-c",
                "copy",
                &output.to_string_lossy(),
            ])
            .await;
        let _ = tokio::fs::remove_file(&manifest_path).await;
        result?;

        if !output.exists() {
            return Err(MediaError::MissingOutput(output.to_path_buf()));
        }
        Ok(())
    }
}
