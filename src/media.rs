//! Container probing and still-frame grabbing through the ffmpeg tools.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::*;

/// Width and height of extracted frames.
const FRAME_SIZE: &str = "320x240";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Seconds.
    pub duration: Option<f64>,
    pub bitrate: Option<u64>,
    pub codec: Option<String>,
    pub fps: Option<f64>,
    pub has_audio: bool,
    pub audio_codec: Option<String>,
    pub audio_channels: Option<u32>,
    pub audio_sample_rate: Option<u32>,
    pub size: Option<u64>,
    pub format_name: Option<String>,
}

impl VideoMetadata {
    /// Stand-in block recorded when analysis could not complete.
    pub fn placeholder() -> Self {
        VideoMetadata {
            width: Some(1920),
            height: Some(1080),
            duration: Some(60.0),
            bitrate: Some(5000),
            codec: Some("h264".into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed with exit code {code}: {stderr}")]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("Invalid ffprobe output: {0}")]
    InvalidOutput(#[from] serde_json::Error),

    #[error("Frame was not created: {0}")]
    MissingOutput(PathBuf),
}

/// Media tooling used by the analysis pipeline.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Whether the tooling can be invoked at all.
    async fn check_available(&self) -> bool;

    async fn probe(&self, path: &Path) -> Result<VideoMetadata, MediaError>;

    /// Write the frame at `timestamp_secs` to `output` as an image file.
    async fn extract_frame(
        &self,
        path: &Path,
        timestamp_secs: f64,
        output: &Path,
    ) -> Result<(), MediaError>;
}

/// [`MediaProbe`] backed by the `ffprobe` and `ffmpeg` binaries.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl Ffmpeg {
    /// Binaries from `FFMPEG_PATH`/`FFPROBE_PATH`, falling back to `PATH`.
    pub fn from_env() -> Self {
        Self {
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe_path: std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
        }
    }

    pub fn with_paths(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::from_env()
    }
}

async fn run(mut cmd: Command, program: &str) -> Result<Vec<u8>, MediaError> {
    cmd.env("LC_ALL", "C")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = cmd
        .output()
        .await
        .map_err(|source| MediaError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(MediaError::Failed {
            program: program.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output.stdout)
}

#[async_trait]
impl MediaProbe for Ffmpeg {
    async fn check_available(&self) -> bool {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.arg("-version");
        match run(cmd, &self.ffmpeg_path).await {
            Ok(_) => true,
            Err(err) => {
                error!(message = "FFmpeg not available", error = %err);
                false
            }
        }
    }

    #[instrument(skip(self))]
    async fn probe(&self, path: &Path) -> Result<VideoMetadata, MediaError> {
        let mut cmd = Command::new(&self.ffprobe_path);
        cmd.args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path);

        let stdout = run(cmd, &self.ffprobe_path).await?;
        parse_probe_output(&stdout)
    }

    async fn extract_frame(
        &self,
        path: &Path,
        timestamp_secs: f64,
        output: &Path,
    ) -> Result<(), MediaError> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-nostdin", "-y", "-loglevel", "error"])
            .args(["-ss", &format!("{:.3}", timestamp_secs), "-i"])
            .arg(path)
            .args(["-frames:v", "1", "-s", FRAME_SIZE])
            .arg(output);

        run(cmd, &self.ffmpeg_path).await?;

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(MediaError::MissingOutput(output.to_path_buf()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
    size: Option<String>,
    format_name: Option<String>,
}

/// `"30000/1001"` or `"25"`.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let mut parts = rate.splitn(2, '/');
    let num: f64 = parts.next()?.trim().parse().ok()?;
    if !num.is_finite() {
        return None;
    }
    match parts.next().and_then(|d| d.trim().parse::<f64>().ok()) {
        Some(den) if den != 0.0 && den.is_finite() => Some(num / den),
        _ => Some(num),
    }
}

pub(crate) fn parse_probe_output(stdout: &[u8]) -> Result<VideoMetadata, MediaError> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(VideoMetadata {
        width: video.and_then(|s| s.width),
        height: video.and_then(|s| s.height),
        duration: probe
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0),
        bitrate: probe.format.bit_rate.as_deref().and_then(|b| b.parse().ok()),
        codec: video.and_then(|s| s.codec_name.clone()),
        fps: video
            .and_then(|s| s.r_frame_rate.as_deref())
            .and_then(parse_frame_rate),
        has_audio: audio.is_some(),
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
        audio_channels: audio.and_then(|s| s.channels),
        audio_sample_rate: audio
            .and_then(|s| s.sample_rate.as_deref())
            .and_then(|r| r.parse().ok()),
        size: probe.format.size.as_deref().and_then(|s| s.parse().ok()),
        format_name: probe.format.format_name,
    })
}
