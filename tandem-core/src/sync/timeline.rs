/// Secondary target position for a given primary position and offset.
pub fn reaction_target(primary_seconds: f64, offset_seconds: f64) -> f64 {
    (primary_seconds - offset_seconds).max(0.0)
}

/// Signed seconds subtracted from the primary position to obtain the
/// secondary position. Always within `[-limit, limit]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Offset {
    seconds: f64,
    limit: f64,
}

impl Offset {
    pub fn new(limit: f64) -> Self {
        Self {
            seconds: 0.0,
            limit: limit.abs(),
        }
    }

    pub fn seconds(&self) -> f64 {
        self.seconds
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Non-finite values are ignored. Returns the stored value.
    pub fn set(&mut self, seconds: f64) -> f64 {
        if seconds.is_finite() {
            self.seconds = seconds.clamp(-self.limit, self.limit);
        }
        self.seconds
    }

    pub fn nudge(&mut self, delta: f64) -> f64 {
        self.set(self.seconds + delta)
    }

    pub fn reset(&mut self) {
        self.seconds = 0.0;
    }

    pub fn reaction_target(&self, primary_seconds: f64) -> f64 {
        reaction_target(primary_seconds, self.seconds)
    }
}

/// Shared scrubber state for the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeline {
    current_seconds: f64,
    duration_seconds: f64,
}

impl Default for Timeline {
    fn default() -> Self {
        Self {
            current_seconds: 0.0,
            duration_seconds: 1.0,
        }
    }
}

impl Timeline {
    pub fn current_seconds(&self) -> f64 {
        self.current_seconds
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    pub fn clamp(&self, seconds: f64) -> f64 {
        if !seconds.is_finite() {
            return 0.0;
        }
        seconds.clamp(0.0, self.duration_seconds.max(0.0))
    }

    pub fn set_current(&mut self, seconds: f64) {
        if seconds.is_finite() {
            self.current_seconds = self.clamp(seconds);
        }
    }

    /// Unknown or non-finite durations keep the previous value.
    pub fn set_duration(&mut self, candidate: Option<f64>) {
        if let Some(duration) = candidate.filter(|value| value.is_finite() && *value > 0.0) {
            self.duration_seconds = duration;
            self.current_seconds = self.clamp(self.current_seconds);
        }
    }
}
