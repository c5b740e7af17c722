use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use super::error::{ConversionError, ConversionResult};
use super::remux::{Demuxer, Muxer};
use super::types::{ExportPreset, TrackInfo, TrackKind};
use crate::config::TandemConfig;
use crate::process::{command_line, locate_executable, CommandExecutor};

/// Media capabilities the conversion pipeline relies on.
#[async_trait]
pub trait MediaFramework: Send + Sync {
    async fn inspect(&self, source: &Path) -> ConversionResult<Vec<TrackInfo>>;

    /// Opens `source` for packet reading and `output` for packet writing.
    async fn open_remux(
        &self,
        source: &Path,
        output: &Path,
    ) -> ConversionResult<(Box<dyn Demuxer>, Box<dyn Muxer>)>;

    /// Presets the framework can apply to `source`, unordered.
    async fn compatible_presets(&self, source: &Path) -> ConversionResult<Vec<ExportPreset>>;

    async fn export(
        &self,
        source: &Path,
        preset: ExportPreset,
        output: &Path,
    ) -> ConversionResult<()>;

    async fn verify_playable(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub tracks: Vec<TrackInfo>,
    pub duration_seconds: Option<f64>,
    pub format_name: Option<String>,
}

impl ProbeReport {
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }

    pub fn is_playable(&self) -> bool {
        self.duration_seconds
            .map(|d| d.is_finite() && d > 0.0)
            .unwrap_or(false)
            && self.has_video()
    }
}

/// [`MediaFramework`] backed by ffprobe and ffmpeg, with in-process packet
/// copy when built with `embedded-remux`.
pub struct FfmpegFramework {
    executor: Arc<dyn CommandExecutor>,
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    video_codecs: Vec<String>,
}

impl std::fmt::Debug for FfmpegFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegFramework")
            .field("ffmpeg", &self.ffmpeg)
            .field("ffprobe", &self.ffprobe)
            .finish()
    }
}

impl FfmpegFramework {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: &TandemConfig) -> Self {
        let external = &config.external;
        let resolve = |configured: &str| {
            locate_executable(configured, &external.search_paths)
                .unwrap_or_else(|| PathBuf::from(configured))
        };
        Self {
            executor,
            ffmpeg: resolve(&external.ffmpeg_path),
            ffprobe: resolve(&external.ffprobe_path),
            video_codecs: config.conversion.video_codecs.clone(),
        }
    }

    pub fn ffprobe_path(&self) -> &Path {
        &self.ffprobe
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg
    }

    pub async fn probe(&self, path: &Path) -> ConversionResult<ProbeReport> {
        let mut command = Command::new(&self.ffprobe);
        command
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(path);
        let output = self.executor.run(&mut command).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ConversionError::ExternalToolUnavailable(self.ffprobe.display().to_string())
            } else {
                ConversionError::io(path, err)
            }
        })?;
        if !output.status.success() {
            return Err(ConversionError::Command {
                command: command_line(&command),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_probe(&output.stdout)
    }

    fn export_args(preset: ExportPreset) -> Vec<&'static str> {
        match preset {
            ExportPreset::Passthrough => vec!["-c", "copy"],
            ExportPreset::Highest => vec![
                "-c:v", "libx264", "-preset", "slow", "-crf", "18", "-c:a", "aac", "-b:a", "256k",
            ],
            ExportPreset::Medium => vec![
                "-c:v", "libx264", "-preset", "medium", "-crf", "23", "-c:a", "aac", "-b:a",
                "160k",
            ],
        }
    }
}

#[async_trait]
impl MediaFramework for FfmpegFramework {
    async fn inspect(&self, source: &Path) -> ConversionResult<Vec<TrackInfo>> {
        Ok(self.probe(source).await?.tracks)
    }

    #[cfg(feature = "embedded-remux")]
    async fn open_remux(
        &self,
        source: &Path,
        output: &Path,
    ) -> ConversionResult<(Box<dyn Demuxer>, Box<dyn Muxer>)> {
        let source = source.to_path_buf();
        let output = output.to_path_buf();
        tokio::task::spawn_blocking(move || super::libav::open(&source, &output))
            .await
            .map_err(|err| ConversionError::Framework(format!("libav open failed: {err}")))?
    }

    #[cfg(not(feature = "embedded-remux"))]
    async fn open_remux(
        &self,
        _source: &Path,
        _output: &Path,
    ) -> ConversionResult<(Box<dyn Demuxer>, Box<dyn Muxer>)> {
        Err(ConversionError::UnsupportedContainerOrCodec(
            "embedded remux backend not compiled in".into(),
        ))
    }

    async fn compatible_presets(&self, source: &Path) -> ConversionResult<Vec<ExportPreset>> {
        let report = self.probe(source).await?;
        let copyable = report.tracks.iter().any(|track| {
            track.kind == TrackKind::Video
                && self
                    .video_codecs
                    .iter()
                    .any(|codec| codec.eq_ignore_ascii_case(&track.codec))
        });
        let mut presets = Vec::with_capacity(3);
        if copyable {
            presets.push(ExportPreset::Passthrough);
        }
        presets.extend([ExportPreset::Highest, ExportPreset::Medium]);
        Ok(presets)
    }

    async fn export(
        &self,
        source: &Path,
        preset: ExportPreset,
        output: &Path,
    ) -> ConversionResult<()> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-y")
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(source)
            .args(["-map", "0:v:0", "-map", "0:a:0?"])
            .args(Self::export_args(preset))
            .args(["-movflags", "+faststart", "-f", "mp4"])
            .arg(output);
        debug!(command = %command_line(&command), "exporting");
        let result = self.executor.run(&mut command).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ConversionError::ExternalToolUnavailable(self.ffmpeg.display().to_string())
            } else {
                ConversionError::io(output, err)
            }
        })?;
        if !result.status.success() {
            return Err(ConversionError::Command {
                command: command_line(&command),
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn verify_playable(&self, path: &Path) -> bool {
        match self.probe(path).await {
            Ok(report) => report.is_playable(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "playability probe failed");
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: usize,
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    time_base: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
}

pub fn parse_probe(raw: &[u8]) -> ConversionResult<ProbeReport> {
    let parsed: FfprobeOutput = serde_json::from_slice(raw)
        .map_err(|err| ConversionError::Framework(format!("invalid ffprobe payload: {err}")))?;
    let tracks = parsed
        .streams
        .into_iter()
        .map(|stream| TrackInfo {
            index: stream.index,
            kind: TrackKind::from_codec_type(stream.codec_type.as_deref()),
            codec: stream.codec_name.unwrap_or_default(),
            time_base: parse_time_base(stream.time_base.as_deref()).unwrap_or((1, 1000)),
            width: stream.width,
            height: stream.height,
            language: stream.tags.get("language").cloned(),
        })
        .collect();
    let duration_seconds = parsed
        .format
        .duration
        .as_deref()
        .and_then(|value| value.parse::<f64>().ok());
    Ok(ProbeReport {
        tracks,
        duration_seconds,
        format_name: parsed.format.format_name,
    })
}

fn parse_time_base(value: Option<&str>) -> Option<(i32, i32)> {
    let (num, den) = value?.split_once('/')?;
    let num = num.trim().parse::<i32>().ok()?;
    let den = den.trim().parse::<i32>().ok()?;
    (den != 0).then_some((num, den))
}
