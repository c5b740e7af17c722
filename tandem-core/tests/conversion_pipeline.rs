use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use tandem_core::conversion::{Demuxer, Muxer, Packet};
use tandem_core::{
    CommandExecutor, ConversionError, ConversionPipeline, ConversionRequest, ConversionResult,
    ConversionSection, ExportPreset, ExternalConverter, ExternalSection, MediaFramework,
    StrategyKind, TrackInfo, TrackKind,
};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::Notify;

const PLAYABLE: &[u8] = b"playable";
const BROKEN: &[u8] = b"broken";

fn track(index: usize, kind: TrackKind, codec: &str) -> TrackInfo {
    TrackInfo {
        index,
        kind,
        codec: codec.into(),
        time_base: (1, 90_000),
        width: None,
        height: None,
        language: None,
    }
}

fn mkv_tracks() -> Vec<TrackInfo> {
    vec![
        track(0, TrackKind::Video, "h264"),
        track(1, TrackKind::Audio, "ac3"),
        track(2, TrackKind::Subtitle, "ass"),
    ]
}

type Written = Arc<Mutex<Vec<(usize, i64, i64)>>>;

#[derive(Default)]
struct Behavior {
    fail_remux_with_audio: bool,
    fail_remux: bool,
    broken_remux_output: bool,
    export_works: bool,
    hold: Option<Hold>,
}

/// Parks inspection of one source until released.
struct Hold {
    source: String,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

struct FakeFramework {
    tracks: Vec<TrackInfo>,
    behavior: Behavior,
    calls: Mutex<Vec<String>>,
    written: Written,
}

impl FakeFramework {
    fn new(tracks: Vec<TrackInfo>, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            tracks,
            behavior,
            calls: Mutex::new(Vec::new()),
            written: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .cloned()
            .collect()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().to_string()
}

#[async_trait]
impl MediaFramework for FakeFramework {
    async fn inspect(&self, source: &Path) -> ConversionResult<Vec<TrackInfo>> {
        self.record("inspect".into());
        if let Some(hold) = &self.behavior.hold {
            if file_name(source) == hold.source {
                hold.entered.notify_one();
                hold.release.notified().await;
            }
        }
        Ok(self.tracks.clone())
    }

    async fn open_remux(
        &self,
        _source: &Path,
        output: &Path,
    ) -> ConversionResult<(Box<dyn Demuxer>, Box<dyn Muxer>)> {
        let name = file_name(output);
        self.record(format!("open_remux:{name}"));
        let with_audio = name.contains("remux-av");
        if self.behavior.fail_remux || (with_audio && self.behavior.fail_remux_with_audio) {
            return Err(ConversionError::Framework("demuxer refused input".into()));
        }
        let demuxer = FakeDemuxer {
            tracks: self.tracks.clone(),
            packets: sample_packets(),
        };
        let muxer = FakeMuxer {
            output: output.to_path_buf(),
            broken: self.behavior.broken_remux_output,
            written: Arc::clone(&self.written),
            streams: 0,
        };
        Ok((Box::new(demuxer), Box::new(muxer)))
    }

    async fn compatible_presets(&self, _source: &Path) -> ConversionResult<Vec<ExportPreset>> {
        Ok(vec![ExportPreset::Medium, ExportPreset::Highest])
    }

    async fn export(
        &self,
        source: &Path,
        preset: ExportPreset,
        output: &Path,
    ) -> ConversionResult<()> {
        self.record(format!("export:{preset}:{}", file_name(source)));
        if !self.behavior.export_works {
            return Err(ConversionError::Framework(format!("{preset} export failed")));
        }
        std::fs::write(output, PLAYABLE).map_err(|err| ConversionError::io(output, err))
    }

    async fn verify_playable(&self, path: &Path) -> bool {
        std::fs::read(path)
            .map(|content| content == PLAYABLE)
            .unwrap_or(false)
    }
}

fn sample_packets() -> VecDeque<Packet> {
    let packet = |stream: usize, dts: Option<i64>, pts: Option<i64>| Packet {
        stream,
        dts,
        pts,
        duration: 3000,
        keyframe: false,
        data: vec![0u8; 16],
    };
    VecDeque::from(vec![
        packet(0, Some(90_000), Some(93_000)),
        packet(1, Some(91_000), Some(91_000)),
        packet(2, Some(90_500), Some(90_500)),
        packet(0, Some(93_000), Some(99_000)),
        packet(0, Some(93_000), Some(96_000)),
        packet(1, None, Some(92_920)),
        packet(0, Some(80_000), Some(70_000)),
    ])
}

struct FakeDemuxer {
    tracks: Vec<TrackInfo>,
    packets: VecDeque<Packet>,
}

impl Demuxer for FakeDemuxer {
    fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }

    fn read_packet(&mut self) -> ConversionResult<Option<Packet>> {
        Ok(self.packets.pop_front())
    }
}

struct FakeMuxer {
    output: PathBuf,
    broken: bool,
    written: Written,
    streams: usize,
}

impl Muxer for FakeMuxer {
    fn add_stream(&mut self, _track: &TrackInfo) -> ConversionResult<usize> {
        self.streams += 1;
        Ok(self.streams - 1)
    }

    fn write_header(&mut self) -> ConversionResult<()> {
        Ok(())
    }

    fn write_packet(&mut self, stream: usize, packet: Packet) -> ConversionResult<()> {
        let (Some(dts), Some(pts)) = (packet.dts, packet.pts) else {
            return Err(ConversionError::Framework("unset timestamps".into()));
        };
        self.written.lock().unwrap().push((stream, dts, pts));
        Ok(())
    }

    fn finish(&mut self) -> ConversionResult<()> {
        let content = if self.broken { BROKEN } else { PLAYABLE };
        std::fs::write(&self.output, content).map_err(|err| ConversionError::io(&self.output, err))
    }
}

/// Pretends to be ffmpeg: writes a playable file at the last argument.
#[derive(Default)]
struct FakeFfmpeg {
    invocations: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl CommandExecutor for FakeFfmpeg {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        if let Some(output) = args.last() {
            std::fs::write(output, PLAYABLE)?;
        }
        self.invocations.lock().unwrap().push(args);
        Ok(success())
    }
}

#[cfg(unix)]
fn success() -> Output {
    use std::os::unix::process::ExitStatusExt;
    Output {
        status: std::process::ExitStatus::from_raw(0),
        stdout: Vec::new(),
        stderr: Vec::new(),
    }
}

#[cfg(windows)]
fn success() -> Output {
    use std::os::windows::process::ExitStatusExt;
    Output {
        status: std::process::ExitStatus::from_raw(0),
        stdout: Vec::new(),
        stderr: Vec::new(),
    }
}

struct Fixture {
    dir: TempDir,
    source: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("movie.mkv");
        std::fs::write(&source, vec![7u8; 2048]).unwrap();
        Self { dir, source }
    }

    fn settings(&self) -> ConversionSection {
        ConversionSection {
            cache_dir: self.dir.path().join("cache"),
            ..ConversionSection::default()
        }
    }

    fn request(&self, modified_secs: u64) -> ConversionRequest {
        ConversionRequest::new(
            self.source.clone(),
            2048,
            UNIX_EPOCH + Duration::from_secs(modified_secs),
            true,
        )
    }

    fn pipeline(&self, framework: Arc<FakeFramework>) -> ConversionPipeline {
        let external = ExternalConverter::with_binary(
            Arc::new(FakeFfmpeg::default()),
            None,
            &ExternalSection::default(),
        );
        ConversionPipeline::new(self.settings(), framework, external).unwrap()
    }

    fn cache_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path().join("cache"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

#[tokio::test]
async fn identical_identity_reuses_cached_output() {
    let fixture = Fixture::new();
    let framework = FakeFramework::new(mkv_tracks(), Behavior::default());
    let pipeline = fixture.pipeline(Arc::clone(&framework));

    let first = pipeline.convert(fixture.request(1_000)).await.unwrap();
    assert_eq!(first.strategy, Some(StrategyKind::RemuxWithAudio));
    assert!(!first.reused_cache);
    assert!(first.failures_before_success.is_empty());
    assert!(first.output.exists());

    let second = pipeline.convert(fixture.request(1_000)).await.unwrap();
    assert!(second.reused_cache);
    assert_eq!(second.key, first.key);
    assert_eq!(second.output, first.output);
    assert_eq!(second.strategy, Some(StrategyKind::RemuxWithAudio));
    assert_eq!(framework.calls("open_remux").len(), 1);

    let touched = pipeline.convert(fixture.request(2_000)).await.unwrap();
    assert!(!touched.reused_cache);
    assert_ne!(touched.key, first.key);
    assert_eq!(framework.calls("open_remux").len(), 2);
    assert!(pipeline.progress().current().is_none());
}

#[tokio::test]
async fn stale_cache_entry_is_regenerated() {
    let fixture = Fixture::new();
    let framework = FakeFramework::new(mkv_tracks(), Behavior::default());
    let pipeline = fixture.pipeline(Arc::clone(&framework));

    let first = pipeline.convert(fixture.request(1_000)).await.unwrap();
    std::fs::write(&first.output, BROKEN).unwrap();

    let again = pipeline.convert(fixture.request(1_000)).await.unwrap();
    assert!(!again.reused_cache);
    assert_eq!(again.output, first.output);
    assert_eq!(std::fs::read(&again.output).unwrap(), PLAYABLE);
}

#[tokio::test]
async fn stream_copy_normalizes_selected_streams() {
    let fixture = Fixture::new();
    let framework = FakeFramework::new(mkv_tracks(), Behavior::default());
    let pipeline = fixture.pipeline(Arc::clone(&framework));
    pipeline.convert(fixture.request(1_000)).await.unwrap();

    let written = framework.written.lock().unwrap().clone();
    assert_eq!(written.len(), 6, "subtitle packet must be dropped");
    for stream in [0usize, 1] {
        let packets: Vec<_> = written.iter().filter(|(s, _, _)| *s == stream).collect();
        assert_eq!(packets[0].1, 0);
        for pair in packets.windows(2) {
            assert!(pair[1].1 > pair[0].1);
        }
        assert!(packets.iter().all(|(_, dts, pts)| pts >= dts));
    }
}

#[tokio::test]
async fn video_only_remux_wins_after_first_strategy_fails() {
    let fixture = Fixture::new();
    let framework = FakeFramework::new(
        mkv_tracks(),
        Behavior {
            fail_remux_with_audio: true,
            export_works: true,
            ..Behavior::default()
        },
    );
    let pipeline = fixture.pipeline(Arc::clone(&framework));

    let outcome = pipeline.convert(fixture.request(1_000)).await.unwrap();
    assert_eq!(outcome.strategy, Some(StrategyKind::RemuxVideoOnly));
    assert_eq!(outcome.failures_before_success.len(), 1);
    assert_eq!(
        outcome.failures_before_success[0].strategy,
        StrategyKind::RemuxWithAudio
    );
    assert!(framework.calls("export").is_empty());
    let written = framework.written.lock().unwrap().clone();
    assert!(written.iter().all(|(stream, _, _)| *stream == 0));
    assert_eq!(fixture.cache_files().len(), 2);
}

#[tokio::test]
async fn video_only_request_skips_audio_remux() {
    let fixture = Fixture::new();
    let framework = FakeFramework::new(mkv_tracks(), Behavior::default());
    let pipeline = fixture.pipeline(Arc::clone(&framework));

    let request = ConversionRequest::new(
        fixture.source.clone(),
        2048,
        UNIX_EPOCH + Duration::from_secs(1_000),
        false,
    );
    let outcome = pipeline.convert(request).await.unwrap();
    assert_eq!(outcome.strategy, Some(StrategyKind::RemuxVideoOnly));
    assert!(outcome.failures_before_success.is_empty());
    let opened = framework.calls("open_remux");
    assert_eq!(opened.len(), 1);
    assert!(opened[0].contains(".partial.remux-v."));
    let written = framework.written.lock().unwrap().clone();
    assert!(written.iter().all(|(stream, _, _)| *stream == 0));
}

#[tokio::test]
async fn progress_survives_while_another_conversion_runs() {
    let fixture = Fixture::new();
    let other = fixture.dir.path().join("other.mkv");
    std::fs::write(&other, vec![3u8; 1024]).unwrap();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let framework = FakeFramework::new(
        mkv_tracks(),
        Behavior {
            hold: Some(Hold {
                source: "other.mkv".into(),
                entered: Arc::clone(&entered),
                release: Arc::clone(&release),
            }),
            ..Behavior::default()
        },
    );
    let pipeline = fixture.pipeline(Arc::clone(&framework));

    let slow_request = ConversionRequest::new(
        other,
        1024,
        UNIX_EPOCH + Duration::from_secs(1_000),
        true,
    );
    let (slow, progress_after_fast) = tokio::join!(pipeline.convert(slow_request), async {
        entered.notified().await;
        pipeline.convert(fixture.request(1_000)).await.unwrap();
        let progress = pipeline.progress().current();
        release.notify_one();
        progress
    });
    assert!(progress_after_fast.is_some());
    assert!(slow.is_ok());
    assert!(pipeline.progress().current().is_none());
}

#[tokio::test]
async fn unplayable_remux_is_repaired_from_its_own_output() {
    let fixture = Fixture::new();
    let framework = FakeFramework::new(
        mkv_tracks(),
        Behavior {
            broken_remux_output: true,
            export_works: true,
            ..Behavior::default()
        },
    );
    let pipeline = fixture.pipeline(Arc::clone(&framework));

    let outcome = pipeline.convert(fixture.request(1_000)).await.unwrap();
    assert_eq!(outcome.strategy, Some(StrategyKind::RepairPass));
    let exports = framework.calls("export");
    assert_eq!(exports.len(), 1);
    assert!(exports[0].starts_with("export:highest:"));
    assert!(exports[0].contains(".partial.remux-av"));
    let names = fixture.cache_files();
    assert!(names.iter().all(|name| !name.contains(".partial.")));
}

#[tokio::test]
async fn exhausted_chain_reports_every_failure_in_order() {
    let fixture = Fixture::new();
    let framework = FakeFramework::new(
        mkv_tracks(),
        Behavior {
            fail_remux: true,
            ..Behavior::default()
        },
    );
    let pipeline = fixture.pipeline(Arc::clone(&framework));

    let err = pipeline.convert(fixture.request(1_000)).await.unwrap_err();
    let ConversionError::Exhausted { failures } = &err else {
        panic!("unexpected error: {err}");
    };
    let strategies: Vec<_> = failures.iter().map(|f| f.strategy).collect();
    assert_eq!(
        strategies,
        vec![
            StrategyKind::RemuxWithAudio,
            StrategyKind::RemuxVideoOnly,
            StrategyKind::Reencode,
            StrategyKind::Reencode,
            StrategyKind::External,
        ]
    );
    assert!(failures[2].detail.starts_with("highest:"));
    assert!(failures[3].detail.starts_with("medium:"));
    let exports = framework.calls("export");
    assert!(exports.iter().all(|call| call.ends_with("movie.mkv")));
    assert_eq!(err.to_string().lines().count(), 1 + failures.len());
    assert!(fixture.cache_files().is_empty());
    assert!(pipeline.progress().current().is_none());
}

#[tokio::test]
async fn audio_only_source_is_fatal() {
    let fixture = Fixture::new();
    let framework = FakeFramework::new(
        vec![track(0, TrackKind::Audio, "flac")],
        Behavior {
            export_works: true,
            ..Behavior::default()
        },
    );
    let pipeline = fixture.pipeline(Arc::clone(&framework));
    let err = pipeline.convert(fixture.request(1_000)).await.unwrap_err();
    assert!(matches!(err, ConversionError::NoCompatibleStream(_)));
    assert!(framework.calls("open_remux").is_empty());
    assert!(framework.calls("export").is_empty());
}

#[tokio::test]
async fn incompatible_video_codec_falls_through_to_reencode() {
    let fixture = Fixture::new();
    let framework = FakeFramework::new(
        vec![track(0, TrackKind::Video, "vp9")],
        Behavior {
            export_works: true,
            ..Behavior::default()
        },
    );
    let pipeline = fixture.pipeline(Arc::clone(&framework));
    let outcome = pipeline.convert(fixture.request(1_000)).await.unwrap();
    assert_eq!(outcome.strategy, Some(StrategyKind::Reencode));
    assert_eq!(outcome.failures_before_success.len(), 2);
    assert!(framework.calls("open_remux").is_empty());
}

#[tokio::test]
async fn external_converter_is_the_last_resort() {
    let fixture = Fixture::new();
    let framework = FakeFramework::new(
        mkv_tracks(),
        Behavior {
            fail_remux: true,
            ..Behavior::default()
        },
    );
    let ffmpeg = Arc::new(FakeFfmpeg::default());
    let external = ExternalConverter::with_binary(
        Arc::clone(&ffmpeg) as Arc<dyn CommandExecutor>,
        Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg")),
        &ExternalSection::default(),
    );
    let pipeline = ConversionPipeline::new(fixture.settings(), framework, external).unwrap();

    let outcome = pipeline.convert(fixture.request(1_000)).await.unwrap();
    assert_eq!(outcome.strategy, Some(StrategyKind::External));
    assert_eq!(outcome.failures_before_success.len(), 4);
    let invocations = ffmpeg.invocations.lock().unwrap();
    assert_eq!(invocations.len(), 1);
    let joined = invocations[0].join(" ");
    assert!(joined.contains("-c copy"));
    assert!(joined.contains("+faststart"));
}

#[tokio::test]
async fn concurrent_requests_convert_once() {
    let fixture = Fixture::new();
    let framework = FakeFramework::new(mkv_tracks(), Behavior::default());
    let pipeline = fixture.pipeline(Arc::clone(&framework));

    let (a, b) = tokio::join!(
        pipeline.convert(fixture.request(1_000)),
        pipeline.convert(fixture.request(1_000))
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.output, b.output);
    assert!(a.reused_cache != b.reused_cache);
    assert_eq!(framework.calls("open_remux").len(), 1);
}

#[tokio::test]
async fn purge_invalid_removes_unplayable_entries() {
    let fixture = Fixture::new();
    let framework = FakeFramework::new(mkv_tracks(), Behavior::default());
    let pipeline = fixture.pipeline(Arc::clone(&framework));

    let keep = pipeline.convert(fixture.request(1_000)).await.unwrap();
    let spoil = pipeline.convert(fixture.request(2_000)).await.unwrap();
    std::fs::write(&spoil.output, BROKEN).unwrap();

    let cache = pipeline.cache();
    assert_eq!(cache.entries().unwrap().len(), 2);
    let removed = cache.purge_invalid(framework.as_ref()).await.unwrap();
    assert_eq!(removed, 1);
    let remaining = cache.entries().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].key, keep.key);
    assert_eq!(
        remaining[0].manifest.as_ref().map(|m| m.source_size),
        Some(2048)
    );
}

#[tokio::test]
async fn needs_conversion_follows_configured_extensions() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline(FakeFramework::new(mkv_tracks(), Behavior::default()));
    assert!(pipeline.needs_conversion(Path::new("/media/a.MKV")));
    assert!(!pipeline.needs_conversion(Path::new("/media/a.mp4")));
    assert!(!pipeline.needs_conversion(Path::new("/media/noext")));

    let passthrough = pipeline
        .prepare(Path::new("/media/a.mp4"), true)
        .await
        .unwrap();
    assert_eq!(passthrough, PathBuf::from("/media/a.mp4"));
}
