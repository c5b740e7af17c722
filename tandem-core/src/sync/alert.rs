use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::transport::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ConversionFailed,
    UnreadableSource,
    UnsupportedSource,
    ResolutionFailed,
    PlaybackError,
}

/// One user-visible message for a terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionAlert {
    pub side: Option<Side>,
    pub kind: AlertKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AlertSink {
    sender: mpsc::UnboundedSender<SessionAlert>,
}

impl AlertSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionAlert>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn raise(&self, side: Option<Side>, kind: AlertKind, message: impl Into<String>) {
        let alert = SessionAlert {
            side,
            kind,
            message: message.into(),
            raised_at: Utc::now(),
        };
        error!(side = ?alert.side, kind = ?alert.kind, message = %alert.message, "session alert");
        if self.sender.send(alert).is_err() {
            warn!("no alert subscriber attached");
        }
    }
}
