use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info};

use super::error::{ConversionError, ConversionResult};
use crate::config::ExternalSection;
use crate::process::{command_line, locate_executable, CommandExecutor};

/// Last-resort conversion through a host `ffmpeg` binary.
pub struct ExternalConverter {
    executor: Arc<dyn CommandExecutor>,
    ffmpeg: Option<PathBuf>,
    settings: ExternalSection,
}

impl std::fmt::Debug for ExternalConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalConverter")
            .field("ffmpeg", &self.ffmpeg)
            .field("enabled", &self.settings.enabled)
            .finish()
    }
}

impl ExternalConverter {
    /// Looks the converter up once. A disabled or missing tool makes every
    /// call fail with [`ConversionError::ExternalToolUnavailable`].
    pub fn discover(executor: Arc<dyn CommandExecutor>, settings: &ExternalSection) -> Self {
        let ffmpeg = if settings.enabled {
            locate_executable(&settings.ffmpeg_path, &settings.search_paths)
        } else {
            None
        };
        match &ffmpeg {
            Some(path) => debug!(path = %path.display(), "external converter found"),
            None => debug!(configured = %settings.ffmpeg_path, "external converter unavailable"),
        }
        Self::with_binary(executor, ffmpeg, settings)
    }

    pub fn with_binary(
        executor: Arc<dyn CommandExecutor>,
        ffmpeg: Option<PathBuf>,
        settings: &ExternalSection,
    ) -> Self {
        Self {
            executor,
            ffmpeg,
            settings: settings.clone(),
        }
    }

    pub fn binary(&self) -> Option<&Path> {
        self.ffmpeg.as_deref()
    }

    pub fn is_available(&self) -> bool {
        self.ffmpeg.is_some()
    }

    pub async fn remux(
        &self,
        source: &Path,
        output: &Path,
        include_audio: bool,
    ) -> ConversionResult<()> {
        let mut args: Vec<String> = vec!["-map".into(), "0:v:0".into()];
        if include_audio {
            args.extend(["-map".into(), "0:a:0?".into()]);
        } else {
            args.push("-an".into());
        }
        args.extend(["-c".into(), "copy".into()]);
        self.run(source, output, args).await
    }

    pub async fn reencode(
        &self,
        source: &Path,
        output: &Path,
        include_audio: bool,
    ) -> ConversionResult<()> {
        let settings = &self.settings;
        let mut args: Vec<String> = vec![
            "-map".into(),
            "0:v:0".into(),
            "-c:v".into(),
            settings.reencode_video_codec.clone(),
            "-preset".into(),
            settings.reencode_preset.clone(),
            "-crf".into(),
            settings.reencode_crf.to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ];
        if include_audio {
            args.extend([
                "-map".into(),
                "0:a:0?".into(),
                "-c:a".into(),
                settings.reencode_audio_codec.clone(),
                "-b:a".into(),
                settings.reencode_audio_bitrate.clone(),
            ]);
        } else {
            args.push("-an".into());
        }
        self.run(source, output, args).await
    }

    async fn run(&self, source: &Path, output: &Path, args: Vec<String>) -> ConversionResult<()> {
        let Some(binary) = &self.ffmpeg else {
            return Err(ConversionError::ExternalToolUnavailable(
                self.settings.ffmpeg_path.clone(),
            ));
        };
        let mut command = Command::new(binary);
        command
            .arg("-y")
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(source)
            .args(&args)
            .args(["-movflags", "+faststart", "-f", "mp4"])
            .arg(output);
        let rendered = command_line(&command);
        info!(command = %rendered, "running external converter");
        let result = self
            .executor
            .run(&mut command)
            .await
            .map_err(|err| ConversionError::io(binary, err))?;
        if !result.status.success() {
            return Err(ConversionError::Command {
                command: rendered,
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
