use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::conversion::ExportPreset;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TandemConfig {
    pub sync: SyncSection,
    pub conversion: ConversionSection,
    pub external: ExternalSection,
    pub embedded: EmbeddedSection,
    pub resolver: ResolverSection,
}

impl TandemConfig {
    /// Relative paths in the file are interpreted against `base`.
    pub fn resolve_paths<P: AsRef<Path>>(mut self, base: P) -> Self {
        let base = base.as_ref();
        if self.conversion.cache_dir.is_relative() {
            self.conversion.cache_dir = base.join(&self.conversion.cache_dir);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sync.offset_limit_seconds.is_finite() && self.sync.offset_limit_seconds > 0.0) {
            return Err(ConfigError::Invalid {
                field: "sync.offset_limit_seconds",
                reason: "must be a positive number".into(),
            });
        }
        if self.sync.max_rate_delta <= 0.0 || self.sync.max_rate_delta >= 1.0 {
            return Err(ConfigError::Invalid {
                field: "sync.max_rate_delta",
                reason: "must be between 0 and 1".into(),
            });
        }
        if self.conversion.video_codecs.is_empty() {
            return Err(ConfigError::Invalid {
                field: "conversion.video_codecs",
                reason: "at least one codec is required".into(),
            });
        }
        self.conversion.presets()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub offset_limit_seconds: f64,
    pub hard_seek_threshold: f64,
    pub rate_deadband: f64,
    pub rate_gain: f64,
    pub max_rate_delta: f64,
    pub seek_tolerance_seconds: f64,
    pub embedded_drift_threshold: f64,
    pub embedded_min_correction_interval_ms: u64,
    pub tick_interval_ms: u64,
    pub start_settle_ms: u64,
}

impl SyncSection {
    pub fn embedded_min_correction_interval(&self) -> Duration {
        Duration::from_millis(self.embedded_min_correction_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            offset_limit_seconds: 600.0,
            hard_seek_threshold: 0.45,
            rate_deadband: 0.03,
            rate_gain: 0.35,
            max_rate_delta: 0.06,
            seek_tolerance_seconds: 0.05,
            embedded_drift_threshold: 1.2,
            embedded_min_correction_interval_ms: 2500,
            tick_interval_ms: 100,
            start_settle_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversionSection {
    pub cache_dir: PathBuf,
    pub convert_extensions: Vec<String>,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
    pub stall_timeout_seconds: u64,
    pub hard_timeout_seconds: u64,
    pub preset_order: Vec<String>,
    pub output_extension: String,
}

impl ConversionSection {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_seconds)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_seconds)
    }

    pub fn presets(&self) -> Result<Vec<ExportPreset>> {
        self.preset_order
            .iter()
            .map(|name| {
                name.parse::<ExportPreset>()
                    .map_err(|reason| ConfigError::Invalid {
                        field: "conversion.preset_order",
                        reason,
                    })
            })
            .collect()
    }
}

impl Default for ConversionSection {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("tandem-converted"),
            convert_extensions: vec!["mkv".into()],
            video_codecs: vec!["h264".into(), "hevc".into()],
            audio_codecs: vec!["aac".into(), "ac3".into(), "eac3".into()],
            stall_timeout_seconds: 20,
            hard_timeout_seconds: 240,
            preset_order: vec!["passthrough".into(), "highest".into(), "medium".into()],
            output_extension: "mp4".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExternalSection {
    pub enabled: bool,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub search_paths: Vec<PathBuf>,
    pub reencode_video_codec: String,
    pub reencode_crf: u8,
    pub reencode_preset: String,
    pub reencode_audio_codec: String,
    pub reencode_audio_bitrate: String,
}

impl Default for ExternalSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ffmpeg_path: "ffmpeg".into(),
            ffprobe_path: "ffprobe".into(),
            search_paths: vec![
                PathBuf::from("/opt/homebrew/bin"),
                PathBuf::from("/usr/local/bin"),
                PathBuf::from("/usr/bin"),
            ],
            reencode_video_codec: "libx264".into(),
            reencode_crf: 20,
            reencode_preset: "veryfast".into(),
            reencode_audio_codec: "aac".into(),
            reencode_audio_bitrate: "192k".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddedSection {
    pub poll_interval_ms: u64,
    pub command_queue_limit: usize,
    /// A time report within this distance of a pending seek target counts as
    /// the seek having landed.
    pub seek_settle_tolerance_seconds: f64,
    /// After this long without a matching report a pending seek is abandoned
    /// and time reports are trusted again.
    pub seek_settle_timeout_ms: u64,
}

impl EmbeddedSection {
    pub fn seek_settle_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_settle_timeout_ms)
    }
}

impl Default for EmbeddedSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            command_queue_limit: 64,
            seek_settle_tolerance_seconds: 1.2,
            seek_settle_timeout_ms: 2500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverSection {
    pub timeout_seconds: u64,
    pub user_agent: String,
    pub providers: Vec<String>,
}

impl ResolverSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            user_agent: "Tandem/0.1".into(),
            providers: vec![
                "youtube.com".into(),
                "www.youtube.com".into(),
                "m.youtube.com".into(),
                "music.youtube.com".into(),
                "youtu.be".into(),
                "www.youtube-nocookie.com".into(),
            ],
        }
    }
}

pub fn load_tandem_config<P: AsRef<Path>>(path: P) -> Result<TandemConfig> {
    let path = path.as_ref();
    let config: TandemConfig = load_toml(path)?;
    config.validate()?;
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(config.resolve_paths(base))
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
