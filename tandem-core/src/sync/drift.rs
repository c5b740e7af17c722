use tokio::time::Instant;

use crate::config::SyncSection;

/// What the drift loop should do to the secondary for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    None,
    NormalizeRate,
    AdjustRate(f64),
    HardSeek { target: f64 },
}

#[derive(Debug, Clone)]
pub struct DriftPolicy {
    hard_seek_threshold: f64,
    rate_deadband: f64,
    rate_gain: f64,
    max_rate_delta: f64,
    embedded_threshold: f64,
    embedded_interval: std::time::Duration,
}

impl DriftPolicy {
    pub fn new(config: &SyncSection) -> Self {
        Self {
            hard_seek_threshold: config.hard_seek_threshold,
            rate_deadband: config.rate_deadband,
            rate_gain: config.rate_gain,
            max_rate_delta: config.max_rate_delta,
            embedded_threshold: config.embedded_drift_threshold,
            embedded_interval: config.embedded_min_correction_interval(),
        }
    }

    /// Rate-controllable secondary: large errors seek, small ones are nudged
    /// through playback rate, tiny ones leave the rate at 1.0.
    pub fn native(&self, desired: f64, actual: f64) -> Correction {
        let drift = desired - actual;
        if !drift.is_finite() {
            return Correction::None;
        }
        if drift.abs() >= self.hard_seek_threshold {
            Correction::HardSeek { target: desired }
        } else if drift.abs() <= self.rate_deadband {
            Correction::NormalizeRate
        } else {
            let rate = (1.0 + drift * self.rate_gain)
                .clamp(1.0 - self.max_rate_delta, 1.0 + self.max_rate_delta);
            Correction::AdjustRate(rate)
        }
    }

    /// Seek-only secondary, rate limited by the minimum correction interval.
    pub fn embedded(
        &self,
        desired: f64,
        actual: f64,
        last_correction: Option<Instant>,
        now: Instant,
    ) -> Correction {
        let drift = desired - actual;
        if !drift.is_finite() || drift.abs() < self.embedded_threshold {
            return Correction::None;
        }
        let cooled_down = last_correction
            .map(|at| now.saturating_duration_since(at) >= self.embedded_interval)
            .unwrap_or(true);
        if cooled_down {
            Correction::HardSeek { target: desired }
        } else {
            Correction::None
        }
    }
}
