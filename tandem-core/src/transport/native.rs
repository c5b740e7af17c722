use tracing::debug;

use super::types::{MediaSource, PlaybackStatus, SeekCompletion, TransportResult};

/// A local decoder with fine-grained rate control. Implemented by the host
/// application around its media engine.
pub trait NativePlayer: Send {
    fn load(&mut self, source: &MediaSource) -> TransportResult<()>;
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, to: f64, tolerance_before: f64, tolerance_after: f64);
    fn set_rate(&mut self, rate: f64);
    fn position(&self) -> f64;
    fn duration(&self) -> Option<f64>;
    fn status(&self) -> PlaybackStatus;
    fn set_volume(&mut self, volume: f32);
    fn set_muted(&mut self, muted: bool);

    /// Natural video size, used for the aspect ratio of the primary side.
    fn presentation_size(&self) -> Option<(u32, u32)> {
        None
    }

    /// Detaches observers and releases decoder resources.
    fn release(&mut self) {}
}

pub struct NativeTransport {
    player: Box<dyn NativePlayer>,
    rate: f64,
}

impl std::fmt::Debug for NativeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeTransport")
            .field("rate", &self.rate)
            .field("status", &self.player.status())
            .finish()
    }
}

impl NativeTransport {
    pub fn new(player: Box<dyn NativePlayer>) -> Self {
        Self { player, rate: 1.0 }
    }

    pub fn load(&mut self, source: &MediaSource) -> TransportResult<()> {
        self.player.load(source)?;
        self.rate = 1.0;
        Ok(())
    }

    pub fn play(&mut self) {
        self.player.play();
        if self.rate != 1.0 {
            self.player.set_rate(self.rate);
        }
    }

    pub fn pause(&mut self) {
        self.player.pause();
    }

    pub fn seek(&mut self, to: f64, tolerance_before: f64, tolerance_after: f64) -> SeekCompletion {
        self.player.seek(to, tolerance_before, tolerance_after);
        SeekCompletion::Immediate
    }

    pub fn set_rate(&mut self, rate: f64) {
        if !rate.is_finite() || rate <= 0.0 {
            return;
        }
        if (self.rate - rate).abs() < f64::EPSILON {
            return;
        }
        debug!(rate, "native rate change");
        self.rate = rate;
        if self.player.status() == PlaybackStatus::Playing {
            self.player.set_rate(rate);
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn position(&self) -> f64 {
        self.player.position()
    }

    pub fn duration(&self) -> Option<f64> {
        self.player.duration()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.player.status()
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.player.set_volume(volume);
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.player.set_muted(muted);
    }

    pub fn aspect_ratio(&self) -> Option<f64> {
        self.player
            .presentation_size()
            .filter(|(width, height)| *width > 0 && *height > 0)
            .map(|(width, height)| width as f64 / height as f64)
    }

    pub fn dispose(&mut self) {
        self.player.pause();
        self.player.release();
    }
}
