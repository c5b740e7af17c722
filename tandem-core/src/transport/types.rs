use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bridge error: {0}")]
    Bridge(String),
    #[error("remote player reported error code {code}")]
    Remote { code: i64 },
    #[error("source {0} cannot be played by this transport")]
    IncompatibleSource(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Primary,
    Secondary,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Primary => "primary",
            Side::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregated per-side state used by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    Playing,
    Paused,
    /// Buffering, not yet started or stalled.
    Waiting,
}

/// State codes reported by the embedded player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddedState {
    Unstarted,
    Ended,
    Playing,
    Paused,
    Buffering,
    Cued,
}

impl EmbeddedState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(Self::Unstarted),
            0 => Some(Self::Ended),
            1 => Some(Self::Playing),
            2 => Some(Self::Paused),
            3 => Some(Self::Buffering),
            5 => Some(Self::Cued),
            _ => None,
        }
    }

    pub fn status(self) -> PlaybackStatus {
        match self {
            EmbeddedState::Playing => PlaybackStatus::Playing,
            EmbeddedState::Paused | EmbeddedState::Cued | EmbeddedState::Ended => {
                PlaybackStatus::Paused
            }
            EmbeddedState::Unstarted | EmbeddedState::Buffering => PlaybackStatus::Waiting,
        }
    }
}

/// A source a transport can load: a local file, a direct media URL, or a
/// video id on a recognized embeddable provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaSource {
    LocalFile { path: PathBuf },
    DirectUrl { url: Url },
    Provider { provider: String, video_id: String },
}

impl MediaSource {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        MediaSource::LocalFile { path: path.into() }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, MediaSource::Provider { .. })
    }
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::LocalFile { path } => write!(f, "{}", path.display()),
            MediaSource::DirectUrl { url } => write!(f, "{url}"),
            MediaSource::Provider { provider, video_id } => write!(f, "{provider}:{video_id}"),
        }
    }
}

/// Out-of-band notifications from a transport. Native players push these
/// from their position observer; the embedded bridge decodes them from
/// remote messages.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Ready,
    Status(PlaybackStatus),
    EmbeddedState(EmbeddedState),
    Position {
        seconds: f64,
        duration: Option<f64>,
    },
    SeekCompleted,
    Ended,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SideEvent {
    pub side: Side,
    pub event: TransportEvent,
}

impl SideEvent {
    pub fn new(side: Side, event: TransportEvent) -> Self {
        Self { side, event }
    }
}

/// Whether a seek has finished by the time the call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekCompletion {
    Immediate,
    Pending,
}
