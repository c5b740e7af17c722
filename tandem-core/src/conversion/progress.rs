use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionProgress {
    pub phase: String,
    /// Completion in `[0, 1]` when measurable.
    pub fraction: Option<f64>,
}

/// Publishes the phase of the running conversion. `None` means idle.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: Arc<watch::Sender<Option<ConversionProgress>>>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ConversionProgress>> {
        self.sender.subscribe()
    }

    pub fn publish(&self, phase: impl Into<String>, fraction: Option<f64>) {
        let fraction = fraction
            .filter(|value| value.is_finite())
            .map(|value| value.clamp(0.0, 1.0));
        self.sender.send_replace(Some(ConversionProgress {
            phase: phase.into(),
            fraction,
        }));
    }

    pub fn clear(&self) {
        self.sender.send_replace(None);
    }

    pub fn current(&self) -> Option<ConversionProgress> {
        self.sender.borrow().clone()
    }
}
