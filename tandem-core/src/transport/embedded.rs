//! Remote player reached through an asynchronous message bridge.
//!
//! Commands are serialized to JSON and handed to the host (typically a web
//! view running the provider's iframe API). Until the remote side reports
//! `ready`, commands are queued and flushed in order once it does. State,
//! time and error reports come back as [`BridgeMessage`]s which the host
//! decodes and forwards into the controller's event channel.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::EmbeddedSection;

use super::types::{
    EmbeddedState, MediaSource, PlaybackStatus, SeekCompletion, TransportError, TransportEvent,
    TransportResult,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum BridgeCommand {
    #[serde(rename_all = "camelCase")]
    Load {
        video_id: String,
        start_seconds: f64,
    },
    Play,
    Pause,
    #[serde(rename_all = "camelCase")]
    SeekTo {
        seconds: f64,
        allow_seek_ahead: bool,
    },
    SetVolume {
        volume: u8,
    },
    Mute,
    UnMute,
    #[serde(rename_all = "camelCase")]
    StartPolling {
        interval_ms: u64,
    },
    Destroy,
}

impl BridgeCommand {
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Inbound message from the remote player.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BridgeMessage {
    Ready,
    State {
        data: i64,
    },
    Time {
        current: f64,
        #[serde(default)]
        duration: Option<f64>,
    },
    Error {
        code: i64,
    },
}

impl BridgeMessage {
    pub fn parse(raw: &str) -> TransportResult<Self> {
        serde_json::from_str(raw)
            .map_err(|err| TransportError::Bridge(format!("malformed bridge message: {err}")))
    }

    pub fn into_event(self) -> TransportEvent {
        match self {
            BridgeMessage::Ready => TransportEvent::Ready,
            BridgeMessage::State { data } => match EmbeddedState::from_code(data) {
                Some(state) => TransportEvent::EmbeddedState(state),
                None => TransportEvent::Error(format!("unknown player state {data}")),
            },
            BridgeMessage::Time { current, duration } => TransportEvent::Position {
                seconds: current,
                duration,
            },
            BridgeMessage::Error { code } => {
                TransportEvent::Error(TransportError::Remote { code }.to_string())
            }
        }
    }
}

/// Outbound side of the bridge with pre-ready queueing.
#[derive(Debug)]
pub struct EmbeddedBridge {
    outbound: mpsc::UnboundedSender<BridgeCommand>,
    ready: bool,
    pending: VecDeque<BridgeCommand>,
    queue_limit: usize,
}

impl EmbeddedBridge {
    pub fn new(outbound: mpsc::UnboundedSender<BridgeCommand>, queue_limit: usize) -> Self {
        Self {
            outbound,
            ready: false,
            pending: VecDeque::new(),
            queue_limit: queue_limit.max(1),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn send(&mut self, command: BridgeCommand) {
        if self.ready {
            self.dispatch(command);
            return;
        }
        // Only the latest seek matters before the player exists.
        if matches!(command, BridgeCommand::SeekTo { .. }) {
            self.pending
                .retain(|queued| !matches!(queued, BridgeCommand::SeekTo { .. }));
        }
        if self.pending.len() >= self.queue_limit {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(?dropped, "embedded command queue full, dropping oldest");
            }
        }
        self.pending.push_back(command);
    }

    pub fn mark_ready(&mut self) {
        if self.ready {
            return;
        }
        self.ready = true;
        debug!(queued = self.pending.len(), "embedded player ready, flushing");
        while let Some(command) = self.pending.pop_front() {
            self.dispatch(command);
        }
    }

    fn dispatch(&self, command: BridgeCommand) {
        if self.outbound.send(command).is_err() {
            warn!("embedded bridge closed, command dropped");
        }
    }
}

#[derive(Debug)]
pub struct EmbeddedTransport {
    bridge: EmbeddedBridge,
    poll_interval_ms: u64,
    state: EmbeddedState,
    position: f64,
    duration: Option<f64>,
    pending_seek: Option<PendingSeek>,
    settle_tolerance: f64,
    settle_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
struct PendingSeek {
    target: f64,
    issued: Instant,
}

impl EmbeddedTransport {
    pub fn new(outbound: mpsc::UnboundedSender<BridgeCommand>, config: &EmbeddedSection) -> Self {
        Self {
            bridge: EmbeddedBridge::new(outbound, config.command_queue_limit),
            poll_interval_ms: config.poll_interval_ms,
            state: EmbeddedState::Unstarted,
            position: 0.0,
            duration: None,
            pending_seek: None,
            settle_tolerance: config.seek_settle_tolerance_seconds,
            settle_timeout: config.seek_settle_timeout(),
        }
    }

    pub fn load(&mut self, source: &MediaSource) -> TransportResult<()> {
        let MediaSource::Provider { video_id, .. } = source else {
            return Err(TransportError::IncompatibleSource(source.to_string()));
        };
        self.state = EmbeddedState::Unstarted;
        self.position = 0.0;
        self.duration = None;
        self.pending_seek = None;
        self.bridge.send(BridgeCommand::Load {
            video_id: video_id.clone(),
            start_seconds: 0.0,
        });
        self.bridge.send(BridgeCommand::StartPolling {
            interval_ms: self.poll_interval_ms,
        });
        Ok(())
    }

    pub fn play(&mut self) {
        self.bridge.send(BridgeCommand::Play);
    }

    pub fn pause(&mut self) {
        self.bridge.send(BridgeCommand::Pause);
    }

    pub fn seek(&mut self, to: f64) -> SeekCompletion {
        self.bridge.send(BridgeCommand::SeekTo {
            seconds: to,
            allow_seek_ahead: true,
        });
        self.pending_seek = Some(PendingSeek {
            target: to,
            issued: Instant::now(),
        });
        self.position = to;
        SeekCompletion::Pending
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    /// Last finite duration reported by the remote player.
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn state(&self) -> EmbeddedState {
        self.state
    }

    pub fn status(&self) -> PlaybackStatus {
        self.state.status()
    }

    pub fn is_ready(&self) -> bool {
        self.bridge.is_ready()
    }

    pub fn set_volume(&mut self, volume: f32) {
        let volume = (volume.clamp(0.0, 1.0) * 100.0).round() as u8;
        self.bridge.send(BridgeCommand::SetVolume { volume });
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.bridge.send(if muted {
            BridgeCommand::Mute
        } else {
            BridgeCommand::UnMute
        });
    }

    /// Folds an inbound event into the cached state. Returns `true` when the
    /// event settles an outstanding seek.
    pub fn observe(&mut self, event: &TransportEvent) -> bool {
        match event {
            TransportEvent::Ready => {
                self.bridge.mark_ready();
                false
            }
            TransportEvent::EmbeddedState(state) => {
                self.state = *state;
                false
            }
            TransportEvent::Ended => {
                self.state = EmbeddedState::Ended;
                false
            }
            TransportEvent::Position { seconds, duration } => {
                if let Some(duration) = duration.filter(|d| d.is_finite() && *d > 0.0) {
                    self.duration = Some(duration);
                }
                if !(seconds.is_finite() && *seconds >= 0.0) {
                    return false;
                }
                self.observe_time(*seconds, Instant::now())
            }
            TransportEvent::SeekCompleted => self.pending_seek.take().is_some(),
            TransportEvent::Status(_) | TransportEvent::Error(_) => false,
        }
    }

    /// Reports sampled before an outstanding seek landed are dropped until
    /// one arrives near the target or the seek is abandoned.
    fn observe_time(&mut self, seconds: f64, now: Instant) -> bool {
        let Some(pending) = self.pending_seek else {
            self.position = seconds;
            return false;
        };
        let landed = (seconds - pending.target).abs() <= self.settle_tolerance;
        if !landed && now.saturating_duration_since(pending.issued) < self.settle_timeout {
            debug!(target = pending.target, reported = seconds, "stale time report during seek");
            return false;
        }
        if !landed {
            debug!(target = pending.target, reported = seconds, "seek abandoned");
        }
        self.pending_seek = None;
        self.position = seconds;
        true
    }

    pub fn dispose(&mut self) {
        self.bridge.send(BridgeCommand::Destroy);
    }
}
