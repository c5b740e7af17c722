//! Stream-copy remux engine.
//!
//! Packets move from a [`Demuxer`] to a [`Muxer`] without decoding. The copy
//! loop is synchronous and runs on the blocking pool; [`supervise`] watches
//! its heartbeat from the async side and gives up on stalls or when the hard
//! limit is reached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::error::{ConversionError, ConversionResult};
use super::progress::ProgressReporter;
use super::types::{Packet, TrackInfo, TrackKind};

/// Rebases one output stream's timestamps to zero and keeps them
/// well-ordered.
#[derive(Debug, Default, Clone)]
pub struct TimestampNormalizer {
    baseline: Option<i64>,
    last_dts: Option<i64>,
}

impl TimestampNormalizer {
    /// Returns the `(dts, pts)` pair to write for a packet.
    pub fn normalize(&mut self, dts: Option<i64>, pts: Option<i64>) -> (i64, i64) {
        let next = self.last_dts.map_or(0, |last| last.saturating_add(1));
        let baseline = match (self.baseline, dts.or(pts)) {
            (Some(baseline), _) => baseline,
            (None, Some(first)) => *self.baseline.insert(first),
            (None, None) => 0,
        };
        let rebase = |value: i64| value.saturating_sub(baseline).max(0);

        let mut dts = dts.or(pts).map_or(next, rebase);
        if let Some(last) = self.last_dts {
            if dts <= last {
                dts = last.saturating_add(1);
            }
        }
        let pts = pts.map_or(dts, rebase).max(dts);
        self.last_dts = Some(dts);
        (dts, pts)
    }
}

pub trait Demuxer: Send {
    fn tracks(&self) -> &[TrackInfo];

    /// Next packet in container order, `None` at end of input.
    fn read_packet(&mut self) -> ConversionResult<Option<Packet>>;

    /// Fraction of the input consumed, when the container exposes it.
    fn progress(&self) -> Option<f64> {
        None
    }
}

pub trait Muxer: Send {
    /// Declares an output stream copied from `track`. Returns its index.
    fn add_stream(&mut self, track: &TrackInfo) -> ConversionResult<usize>;

    fn write_header(&mut self) -> ConversionResult<()>;

    fn write_packet(&mut self, stream: usize, packet: Packet) -> ConversionResult<()>;

    fn finish(&mut self) -> ConversionResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSelection {
    pub video: TrackInfo,
    pub audio: Option<TrackInfo>,
}

/// Picks the first allow-listed video track and, when requested, the first
/// allow-listed audio track.
pub fn select_streams(
    tracks: &[TrackInfo],
    video_codecs: &[String],
    audio_codecs: &[String],
    include_audio: bool,
) -> ConversionResult<StreamSelection> {
    let allowed = |codecs: &[String], codec: &str| {
        codecs.iter().any(|candidate| candidate.eq_ignore_ascii_case(codec))
    };
    let mut videos = tracks.iter().filter(|t| t.kind == TrackKind::Video).peekable();
    if videos.peek().is_none() {
        return Err(ConversionError::UnsupportedContainerOrCodec(
            "no video track".into(),
        ));
    }
    let video = videos
        .find(|track| allowed(video_codecs, &track.codec))
        .cloned()
        .ok_or_else(|| {
            let found: Vec<_> = tracks
                .iter()
                .filter(|t| t.kind == TrackKind::Video)
                .map(|t| t.codec.as_str())
                .collect();
            ConversionError::UnsupportedContainerOrCodec(format!(
                "video codec {} cannot be stream-copied",
                found.join(", ")
            ))
        })?;
    let audio = if include_audio {
        tracks
            .iter()
            .find(|track| track.kind == TrackKind::Audio && allowed(audio_codecs, &track.codec))
            .cloned()
    } else {
        None
    };
    Ok(StreamSelection { video, audio })
}

/// Shared between the copy loop and its supervisor.
#[derive(Debug, Default)]
pub struct RemuxControl {
    heartbeat: AtomicU64,
    cancelled: AtomicBool,
    fraction_bits: AtomicU64,
}

impl RemuxControl {
    pub fn beat(&self) {
        self.heartbeat.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat(&self) -> u64 {
        self.heartbeat.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn set_fraction(&self, fraction: f64) {
        self.fraction_bits.store(fraction.to_bits(), Ordering::Relaxed);
    }

    pub fn fraction(&self) -> Option<f64> {
        let bits = self.fraction_bits.load(Ordering::Relaxed);
        (bits != 0).then(|| f64::from_bits(bits))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemuxStats {
    pub packets: u64,
    pub bytes: u64,
}

/// Copies the selected streams. Blocking; call from the blocking pool.
pub fn stream_copy(
    demuxer: &mut dyn Demuxer,
    muxer: &mut dyn Muxer,
    selection: &StreamSelection,
    control: &RemuxControl,
) -> ConversionResult<RemuxStats> {
    let mut routes = HashMap::new();
    routes.insert(selection.video.index, muxer.add_stream(&selection.video)?);
    if let Some(audio) = &selection.audio {
        routes.insert(audio.index, muxer.add_stream(audio)?);
    }
    muxer.write_header()?;

    let mut normalizers: HashMap<usize, TimestampNormalizer> = HashMap::new();
    let mut stats = RemuxStats::default();
    while let Some(mut packet) = demuxer.read_packet()? {
        if control.is_cancelled() {
            return Err(ConversionError::Framework("remux cancelled".into()));
        }
        control.beat();
        if let Some(fraction) = demuxer.progress() {
            control.set_fraction(fraction);
        }
        let Some(&output) = routes.get(&packet.stream) else {
            continue;
        };
        let (dts, pts) = normalizers
            .entry(output)
            .or_default()
            .normalize(packet.dts, packet.pts);
        packet.dts = Some(dts);
        packet.pts = Some(pts);
        stats.packets += 1;
        stats.bytes += packet.data.len() as u64;
        muxer.write_packet(output, packet)?;
    }
    muxer.finish()?;
    debug!(packets = stats.packets, bytes = stats.bytes, "stream copy finished");
    Ok(stats)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogLimits {
    pub stall: Duration,
    pub hard: Duration,
    pub poll: Duration,
}

impl WatchdogLimits {
    pub fn new(stall: Duration, hard: Duration) -> Self {
        Self {
            stall,
            hard,
            poll: Duration::from_millis(500),
        }
    }
}

/// Awaits `work`, cancelling it when `control` shows no forward progress for
/// `limits.stall` or when `limits.hard` elapses.
pub async fn supervise<T, F>(
    work: F,
    control: &RemuxControl,
    limits: WatchdogLimits,
    progress: &ProgressReporter,
    phase: &str,
) -> ConversionResult<T>
where
    F: Future<Output = ConversionResult<T>>,
{
    tokio::pin!(work);
    let started = Instant::now();
    let mut last_beat = control.heartbeat();
    let mut last_progress = started;
    let mut ticker = tokio::time::interval(limits.poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            result = &mut work => return result,
            _ = ticker.tick() => {
                let now = Instant::now();
                let beat = control.heartbeat();
                if beat != last_beat {
                    last_beat = beat;
                    last_progress = now;
                    progress.publish(phase, control.fraction());
                }
                if now.duration_since(started) >= limits.hard {
                    control.cancel();
                    warn!(phase, limit = ?limits.hard, "remux exceeded hard limit");
                    return Err(ConversionError::TimedOut(limits.hard));
                }
                if now.duration_since(last_progress) >= limits.stall {
                    control.cancel();
                    warn!(phase, stall = ?limits.stall, "remux stalled");
                    return Err(ConversionError::Stalled(limits.stall));
                }
            }
        }
    }
}

/// Runs [`stream_copy`] on the blocking pool under [`supervise`].
pub async fn run_remux(
    mut demuxer: Box<dyn Demuxer>,
    mut muxer: Box<dyn Muxer>,
    selection: StreamSelection,
    limits: WatchdogLimits,
    progress: &ProgressReporter,
    phase: &str,
) -> ConversionResult<RemuxStats> {
    let control = Arc::new(RemuxControl::default());
    let worker = Arc::clone(&control);
    let handle = tokio::task::spawn_blocking(move || {
        stream_copy(demuxer.as_mut(), muxer.as_mut(), &selection, &worker)
    });
    let work = async move {
        handle
            .await
            .map_err(|err| ConversionError::Framework(format!("remux worker failed: {err}")))?
    };
    supervise(work, &control, limits, progress, phase).await
}
