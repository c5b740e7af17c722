//! Prepares local files whose container the native player cannot open.
//!
//! [`ConversionPipeline::convert`] first consults the cache, then walks the
//! fallback chain until one strategy yields an output that verifies as
//! playable:
//!
//! 1. in-process stream copy with audio, followed by a repair export when the
//!    copy does not verify,
//! 2. the same without audio,
//! 3. export of the original through the compatible presets,
//! 4. the external converter (stream copy, then a fixed re-encode).
//!
//! Every failure is recorded and returned in [`ConversionError::Exhausted`]
//! when nothing works.

mod cache;
mod error;
mod external;
mod framework;
#[cfg(feature = "embedded-remux")]
mod libav;
mod progress;
mod remux;
mod types;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{ConversionSection, TandemConfig};
use crate::process::CommandExecutor;

pub use cache::{identity_key, CacheEntry, CacheManifest, ConversionCache};
pub use error::{ConversionError, ConversionResult, StrategyFailure};
pub use external::ExternalConverter;
pub use framework::{parse_probe, FfmpegFramework, MediaFramework, ProbeReport};
pub use progress::{ConversionProgress, ProgressReporter};
pub use remux::{
    run_remux, select_streams, stream_copy, supervise, Demuxer, Muxer, RemuxControl, RemuxStats,
    StreamSelection, TimestampNormalizer, WatchdogLimits,
};
pub use types::{
    ConversionOutcome, ConversionRequest, ExportPreset, Packet, StrategyKind, TrackInfo,
    TrackKind,
};

type Inspection = Result<Vec<TrackInfo>, String>;

pub struct ConversionPipeline {
    settings: ConversionSection,
    presets: Vec<ExportPreset>,
    cache: ConversionCache,
    framework: Arc<dyn MediaFramework>,
    external: ExternalConverter,
    progress: ProgressReporter,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for ConversionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionPipeline")
            .field("cache", &self.cache)
            .field("presets", &self.presets)
            .field("external", &self.external)
            .finish()
    }
}

impl ConversionPipeline {
    pub fn new(
        settings: ConversionSection,
        framework: Arc<dyn MediaFramework>,
        external: ExternalConverter,
    ) -> ConversionResult<Self> {
        let presets = settings.presets()?;
        let cache = ConversionCache::new(&settings.cache_dir, settings.output_extension.clone());
        Ok(Self {
            settings,
            presets,
            cache,
            framework,
            external,
            progress: ProgressReporter::new(),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Pipeline over ffmpeg/ffprobe as configured.
    pub fn from_config(
        config: &TandemConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> ConversionResult<Self> {
        let framework = Arc::new(FfmpegFramework::new(Arc::clone(&executor), config));
        let external = ExternalConverter::discover(executor, &config.external);
        Self::new(config.conversion.clone(), framework, external)
    }

    pub fn cache(&self) -> &ConversionCache {
        &self.cache
    }

    pub fn framework(&self) -> &Arc<dyn MediaFramework> {
        &self.framework
    }

    pub fn external(&self) -> &ExternalConverter {
        &self.external
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Whether the file's container has to be converted before playback.
    pub fn needs_conversion(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.settings
                    .convert_extensions
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    /// Returns a path the native player can open: the file itself, or its
    /// converted counterpart.
    pub async fn prepare(&self, path: &Path, include_audio: bool) -> ConversionResult<PathBuf> {
        if !self.needs_conversion(path) {
            return Ok(path.to_path_buf());
        }
        let request = ConversionRequest::from_path(path, include_audio).await?;
        Ok(self.convert(request).await?.output)
    }

    pub async fn convert_path(
        &self,
        path: &Path,
        include_audio: bool,
    ) -> ConversionResult<ConversionOutcome> {
        let request = ConversionRequest::from_path(path, include_audio).await?;
        self.convert(request).await
    }

    /// Converts one source. Concurrent requests for the same identity wait
    /// for the first and then reuse its output.
    pub async fn convert(&self, request: ConversionRequest) -> ConversionResult<ConversionOutcome> {
        let started = Instant::now();
        let key = identity_key(&request.source, request.size, request.modified);
        let gate = self.gate(&key);
        let result = {
            let _guard = gate.lock().await;
            self.convert_exclusive(&request, &key, started).await
        };
        drop(gate);
        if self.release_gate(&key) {
            self.progress.clear();
        }
        if let Err(err) = &result {
            warn!(source = %request.source.display(), error = %err, "conversion failed");
        }
        result
    }

    fn gate(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
        Arc::clone(in_flight.entry(key.to_string()).or_default())
    }

    /// Returns `true` when no conversion is left in flight.
    fn release_gate(&self, key: &str) -> bool {
        let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
        if in_flight
            .get(key)
            .map(|gate| Arc::strong_count(gate) == 1)
            .unwrap_or(false)
        {
            in_flight.remove(key);
        }
        in_flight.is_empty()
    }

    async fn convert_exclusive(
        &self,
        request: &ConversionRequest,
        key: &str,
        started: Instant,
    ) -> ConversionResult<ConversionOutcome> {
        self.cache.ensure_dir().await?;
        if let Some(outcome) = self.reuse_cached(key, started).await? {
            return Ok(outcome);
        }
        self.cache.remove_partials_matching(key).await?;

        self.progress.publish("inspecting source", None);
        let inspection: Inspection = match self.framework.inspect(&request.source).await {
            Ok(tracks) => Ok(tracks),
            Err(err) => Err(err.to_string()),
        };
        if let Ok(tracks) = &inspection {
            if !tracks.iter().any(|track| track.kind == TrackKind::Video) {
                return Err(ConversionError::NoCompatibleStream(request.source.clone()));
            }
        }

        let mut failures = Vec::new();
        let remux_attempts: &[(StrategyKind, bool)] = if request.include_audio {
            &[
                (StrategyKind::RemuxWithAudio, true),
                (StrategyKind::RemuxVideoOnly, false),
            ]
        } else {
            &[(StrategyKind::RemuxVideoOnly, false)]
        };
        for &(strategy, with_audio) in remux_attempts {
            if let Some((produced, used)) = self
                .remux_strategy(strategy, with_audio, &inspection, request, key, &mut failures)
                .await?
            {
                return self
                    .finish(key, request, &produced, used, failures, started)
                    .await;
            }
        }

        if let Some(produced) = self
            .export_strategy(StrategyKind::Reencode, &request.source, key, "reencode", &mut failures)
            .await
        {
            return self
                .finish(key, request, &produced, StrategyKind::Reencode, failures, started)
                .await;
        }

        if let Some(produced) = self.external_strategy(request, key, &mut failures).await {
            return self
                .finish(key, request, &produced, StrategyKind::External, failures, started)
                .await;
        }

        self.cache.remove_partials_matching(key).await?;
        Err(ConversionError::Exhausted { failures })
    }

    async fn reuse_cached(
        &self,
        key: &str,
        started: Instant,
    ) -> ConversionResult<Option<ConversionOutcome>> {
        let Some(existing) = self.cache.existing(key).await else {
            return Ok(None);
        };
        self.progress.publish("verifying cached output", None);
        if !self.framework.verify_playable(&existing).await {
            warn!(key, "cached output failed verification, regenerating");
            self.cache.remove(key).await?;
            return Ok(None);
        }
        info!(key, output = %existing.display(), "reusing cached conversion");
        let strategy = self.cache.manifest(key).await.map(|m| m.strategy);
        Ok(Some(ConversionOutcome {
            output: existing,
            key: key.to_string(),
            strategy,
            reused_cache: true,
            failures_before_success: Vec::new(),
            elapsed: started.elapsed(),
        }))
    }

    /// Stream copy plus, when the copy does not verify, a repair export of
    /// its output. Only fatal errors are returned as `Err`.
    async fn remux_strategy(
        &self,
        strategy: StrategyKind,
        with_audio: bool,
        inspection: &Inspection,
        request: &ConversionRequest,
        key: &str,
        failures: &mut Vec<StrategyFailure>,
    ) -> ConversionResult<Option<(PathBuf, StrategyKind)>> {
        let label = if with_audio { "remux-av" } else { "remux-v" };
        let output = self.cache.partial_path(key, label);
        let produced = match self
            .stream_copy(strategy, with_audio, inspection, request, &output)
            .await
        {
            Ok(()) => output,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                record(failures, strategy, &err);
                self.discard(&output).await;
                return Ok(None);
            }
        };

        self.progress.publish("verifying", None);
        if self.framework.verify_playable(&produced).await {
            return Ok(Some((produced, strategy)));
        }
        record(
            failures,
            strategy,
            &ConversionError::StrategyFailed {
                strategy,
                detail: "output failed playability check".into(),
            },
        );

        let repair_label = format!("repair-{label}");
        let repaired = self
            .export_strategy(StrategyKind::RepairPass, &produced, key, &repair_label, failures)
            .await;
        self.discard(&produced).await;
        Ok(repaired.map(|path| (path, StrategyKind::RepairPass)))
    }

    async fn stream_copy(
        &self,
        strategy: StrategyKind,
        with_audio: bool,
        inspection: &Inspection,
        request: &ConversionRequest,
        output: &Path,
    ) -> ConversionResult<()> {
        let tracks = inspection
            .as_ref()
            .map_err(|detail| ConversionError::StrategyFailed {
                strategy,
                detail: detail.clone(),
            })?;
        let selection = select_streams(
            tracks,
            &self.settings.video_codecs,
            &self.settings.audio_codecs,
            with_audio,
        )?;
        debug!(
            video = %selection.video.codec,
            audio = ?selection.audio.as_ref().map(|a| a.codec.as_str()),
            "stream selection"
        );
        let (demuxer, muxer) = self.framework.open_remux(&request.source, output).await?;
        let phase = strategy.as_str();
        self.progress.publish(phase, Some(0.0));
        let limits = WatchdogLimits::new(self.settings.stall_timeout(), self.settings.hard_timeout());
        run_remux(demuxer, muxer, selection, limits, &self.progress, phase).await?;
        Ok(())
    }

    /// Tries every compatible preset in preference order on `source`.
    async fn export_strategy(
        &self,
        strategy: StrategyKind,
        source: &Path,
        key: &str,
        label: &str,
        failures: &mut Vec<StrategyFailure>,
    ) -> Option<PathBuf> {
        let presets = match self.ordered_presets(strategy, source).await {
            Ok(presets) => presets,
            Err(err) => {
                record(failures, strategy, &err);
                return None;
            }
        };
        for preset in presets {
            let output = self.cache.partial_path(key, &format!("{label}-{preset}"));
            self.progress
                .publish(format!("{strategy} ({preset})"), None);
            let result = match self.framework.export(source, preset, &output).await {
                Ok(()) if self.framework.verify_playable(&output).await => Ok(()),
                Ok(()) => Err(ConversionError::StrategyFailed {
                    strategy,
                    detail: "output failed playability check".into(),
                }),
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => return Some(output),
                Err(err) => {
                    let detail = StrategyFailure::new(strategy, &err).detail;
                    record(
                        failures,
                        strategy,
                        &ConversionError::StrategyFailed {
                            strategy,
                            detail: format!("{preset}: {detail}"),
                        },
                    );
                    self.discard(&output).await;
                }
            }
        }
        None
    }

    async fn ordered_presets(
        &self,
        strategy: StrategyKind,
        source: &Path,
    ) -> ConversionResult<Vec<ExportPreset>> {
        let compatible = self.framework.compatible_presets(source).await?;
        let ordered: Vec<_> = self
            .presets
            .iter()
            .copied()
            .filter(|preset| compatible.contains(preset))
            .collect();
        if ordered.is_empty() {
            return Err(ConversionError::StrategyFailed {
                strategy,
                detail: "no compatible export preset".into(),
            });
        }
        Ok(ordered)
    }

    async fn external_strategy(
        &self,
        request: &ConversionRequest,
        key: &str,
        failures: &mut Vec<StrategyFailure>,
    ) -> Option<PathBuf> {
        let strategy = StrategyKind::External;
        if !self.external.is_available() {
            record(
                failures,
                strategy,
                &ConversionError::ExternalToolUnavailable("ffmpeg not found".into()),
            );
            return None;
        }

        let remuxed = self.cache.partial_path(key, "external-remux");
        self.progress.publish("external remux", None);
        match self
            .external
            .remux(&request.source, &remuxed, request.include_audio)
            .await
        {
            Ok(()) if self.framework.verify_playable(&remuxed).await => return Some(remuxed),
            Ok(()) => record(
                failures,
                strategy,
                &ConversionError::StrategyFailed {
                    strategy,
                    detail: "remuxed output failed playability check".into(),
                },
            ),
            Err(err) => record(failures, strategy, &err),
        }
        self.discard(&remuxed).await;

        let reencoded = self.cache.partial_path(key, "external-reencode");
        self.progress.publish("external re-encode", None);
        match self
            .external
            .reencode(&request.source, &reencoded, request.include_audio)
            .await
        {
            Ok(()) if self.framework.verify_playable(&reencoded).await => return Some(reencoded),
            Ok(()) => record(
                failures,
                strategy,
                &ConversionError::StrategyFailed {
                    strategy,
                    detail: "re-encoded output failed playability check".into(),
                },
            ),
            Err(err) => record(failures, strategy, &err),
        }
        self.discard(&reencoded).await;
        None
    }

    async fn finish(
        &self,
        key: &str,
        request: &ConversionRequest,
        produced: &Path,
        strategy: StrategyKind,
        failures: Vec<StrategyFailure>,
        started: Instant,
    ) -> ConversionResult<ConversionOutcome> {
        let manifest = CacheManifest::new(key, request, strategy);
        let output = self.cache.commit(key, produced, &manifest).await?;
        self.cache.remove_partials_matching(key).await?;
        info!(
            %strategy,
            output = %output.display(),
            failed_attempts = failures.len(),
            "conversion succeeded"
        );
        Ok(ConversionOutcome {
            output,
            key: key.to_string(),
            strategy: Some(strategy),
            reused_cache: false,
            failures_before_success: failures,
            elapsed: started.elapsed(),
        })
    }

    async fn discard(&self, path: &Path) {
        if let Err(err) = tokio::fs::remove_file(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "cannot remove partial output");
            }
        }
    }
}

fn record(failures: &mut Vec<StrategyFailure>, strategy: StrategyKind, err: &ConversionError) {
    let failure = StrategyFailure::new(strategy, err);
    warn!(%strategy, detail = %failure.detail, "conversion strategy failed");
    failures.push(failure);
}
