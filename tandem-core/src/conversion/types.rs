use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::fs;

use super::error::{ConversionError, ConversionResult, StrategyFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
    Data,
    Other,
}

impl TrackKind {
    pub fn from_codec_type(value: Option<&str>) -> Self {
        match value {
            Some("video") => Self::Video,
            Some("audio") => Self::Audio,
            Some("subtitle") => Self::Subtitle,
            Some("data") => Self::Data,
            _ => Self::Other,
        }
    }
}

/// One elementary stream of a container, as seen by the demuxer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackInfo {
    pub index: usize,
    pub kind: TrackKind,
    pub codec: String,
    /// Numerator and denominator of the stream time base.
    pub time_base: (i32, i32),
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub language: Option<String>,
}

/// A compressed packet copied between containers. Timestamps are in the
/// time base of the input stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub stream: usize,
    pub dts: Option<i64>,
    pub pts: Option<i64>,
    pub duration: i64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPreset {
    Passthrough,
    Highest,
    Medium,
}

impl ExportPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportPreset::Passthrough => "passthrough",
            ExportPreset::Highest => "highest",
            ExportPreset::Medium => "medium",
        }
    }
}

impl FromStr for ExportPreset {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "passthrough" => Ok(ExportPreset::Passthrough),
            "highest" => Ok(ExportPreset::Highest),
            "medium" => Ok(ExportPreset::Medium),
            other => Err(format!("unknown export preset `{other}`")),
        }
    }
}

impl fmt::Display for ExportPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fallback chain, in the order it is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RemuxWithAudio,
    RepairPass,
    RemuxVideoOnly,
    Reencode,
    External,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RemuxWithAudio => "remux with audio",
            StrategyKind::RepairPass => "repair pass",
            StrategyKind::RemuxVideoOnly => "video-only remux",
            StrategyKind::Reencode => "re-encode",
            StrategyKind::External => "external converter",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input of one conversion: the source identity plus the audio switch.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    pub source: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub include_audio: bool,
}

impl ConversionRequest {
    pub fn new(source: PathBuf, size: u64, modified: SystemTime, include_audio: bool) -> Self {
        Self {
            source,
            size,
            modified,
            include_audio,
        }
    }

    /// Builds a request from the file on disk, canonicalizing the path.
    pub async fn from_path(path: impl AsRef<Path>, include_audio: bool) -> ConversionResult<Self> {
        let path = path.as_ref();
        let unreadable = |reason: String| ConversionError::UnreadableSource {
            path: path.to_path_buf(),
            reason,
        };
        let source = fs::canonicalize(path)
            .await
            .map_err(|err| unreadable(err.to_string()))?;
        let metadata = fs::metadata(&source)
            .await
            .map_err(|err| unreadable(err.to_string()))?;
        if !metadata.is_file() {
            return Err(unreadable("not a regular file".into()));
        }
        let modified = metadata
            .modified()
            .map_err(|err| unreadable(err.to_string()))?;
        Ok(Self::new(source, metadata.len(), modified, include_audio))
    }
}

#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    pub output: PathBuf,
    pub key: String,
    /// `None` when a cached output was served without a readable manifest.
    pub strategy: Option<StrategyKind>,
    pub reused_cache: bool,
    pub failures_before_success: Vec<StrategyFailure>,
    pub elapsed: Duration,
}
