mod embedded;
mod native;
mod types;

pub use embedded::{BridgeCommand, BridgeMessage, EmbeddedBridge, EmbeddedTransport};
pub use native::{NativePlayer, NativeTransport};
pub use types::{
    EmbeddedState, MediaSource, PlaybackStatus, SeekCompletion, Side, SideEvent, TransportError,
    TransportEvent, TransportResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Native,
    Embedded,
}

/// The playback backend for one side of the session. The variant is fixed at
/// load time from the kind of source being played.
#[derive(Debug)]
pub enum Transport {
    Native(NativeTransport),
    Embedded(EmbeddedTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Native(_) => TransportKind::Native,
            Transport::Embedded(_) => TransportKind::Embedded,
        }
    }

    pub fn load(&mut self, source: &MediaSource) -> TransportResult<()> {
        match self {
            Transport::Native(native) => native.load(source),
            Transport::Embedded(embedded) => embedded.load(source),
        }
    }

    pub fn play(&mut self) {
        match self {
            Transport::Native(native) => native.play(),
            Transport::Embedded(embedded) => embedded.play(),
        }
    }

    pub fn pause(&mut self) {
        match self {
            Transport::Native(native) => native.pause(),
            Transport::Embedded(embedded) => embedded.pause(),
        }
    }

    /// Tolerances are honored by the native backend only; the embedded player
    /// always seeks to the nearest keyframe it chooses.
    pub fn seek(&mut self, to: f64, tolerance_before: f64, tolerance_after: f64) -> SeekCompletion {
        match self {
            Transport::Native(native) => native.seek(to, tolerance_before, tolerance_after),
            Transport::Embedded(embedded) => embedded.seek(to),
        }
    }

    /// Returns `false` when the backend has no rate control.
    pub fn set_rate(&mut self, rate: f64) -> bool {
        match self {
            Transport::Native(native) => {
                native.set_rate(rate);
                true
            }
            Transport::Embedded(_) => false,
        }
    }

    pub fn rate(&self) -> f64 {
        match self {
            Transport::Native(native) => native.rate(),
            Transport::Embedded(_) => 1.0,
        }
    }

    /// Current position, or `None` for a transient non-finite reading.
    pub fn position(&self) -> Option<f64> {
        let seconds = match self {
            Transport::Native(native) => native.position(),
            Transport::Embedded(embedded) => embedded.position(),
        };
        (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
    }

    pub fn duration(&self) -> Option<f64> {
        let duration = match self {
            Transport::Native(native) => native.duration(),
            Transport::Embedded(embedded) => embedded.duration(),
        };
        duration.filter(|value| value.is_finite() && *value > 0.0)
    }

    pub fn status(&self) -> PlaybackStatus {
        match self {
            Transport::Native(native) => native.status(),
            Transport::Embedded(embedded) => embedded.status(),
        }
    }

    pub fn set_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        match self {
            Transport::Native(native) => native.set_volume(volume),
            Transport::Embedded(embedded) => embedded.set_volume(volume),
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        match self {
            Transport::Native(native) => native.set_muted(muted),
            Transport::Embedded(embedded) => embedded.set_muted(muted),
        }
    }

    pub fn aspect_ratio(&self) -> Option<f64> {
        match self {
            Transport::Native(native) => native.aspect_ratio(),
            Transport::Embedded(_) => None,
        }
    }

    /// See [`EmbeddedTransport::observe`]. Native players keep no cached
    /// state, their seeks complete synchronously.
    pub fn observe(&mut self, event: &TransportEvent) -> bool {
        match self {
            Transport::Native(_) => matches!(event, TransportEvent::SeekCompleted),
            Transport::Embedded(embedded) => embedded.observe(event),
        }
    }

    pub fn dispose(&mut self) {
        match self {
            Transport::Native(native) => native.dispose(),
            Transport::Embedded(embedded) => embedded.dispose(),
        }
    }
}
