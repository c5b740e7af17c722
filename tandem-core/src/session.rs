use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{EmbeddedSection, TandemConfig};
use crate::conversion::{ConversionError, ConversionPipeline};
use crate::resolve::{ResolveError, SourceResolver};
use crate::sync::{AlertKind, AlertSink, SyncController};
use crate::transport::{
    BridgeCommand, EmbeddedTransport, MediaSource, NativePlayer, NativeTransport, Side, Transport,
    TransportError,
};

/// Supplies platform players. The host forwards every player notification to
/// the controller's event sender.
pub trait PlayerHost: Send + Sync {
    fn native_player(&self, side: Side) -> Result<Box<dyn NativePlayer>, TransportError>;

    /// Outbound command channel of a fresh embedded player view.
    fn embedded_channel(
        &self,
        side: Side,
    ) -> Result<mpsc::UnboundedSender<BridgeCommand>, TransportError>;
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl LoadError {
    pub fn alert_kind(&self) -> AlertKind {
        match self {
            LoadError::Resolve(ResolveError::NetworkUnreachableOrTimedOut(_)) => {
                AlertKind::ResolutionFailed
            }
            LoadError::Resolve(ResolveError::MissingFile(_))
            | LoadError::Conversion(ConversionError::UnreadableSource { .. }) => {
                AlertKind::UnreadableSource
            }
            LoadError::Resolve(_)
            | LoadError::Conversion(ConversionError::NoCompatibleStream(_))
            | LoadError::Transport(TransportError::IncompatibleSource(_)) => {
                AlertKind::UnsupportedSource
            }
            LoadError::Conversion(_) => AlertKind::ConversionFailed,
            LoadError::Transport(_) => AlertKind::PlaybackError,
        }
    }
}

/// A side ready to be attached to the controller.
#[derive(Debug)]
pub struct PreparedSide {
    pub side: Side,
    pub source: MediaSource,
    pub transport: Transport,
}

/// Resolves, converts when needed, and builds the transport for one side.
pub struct SessionLoader {
    resolver: SourceResolver,
    pipeline: Arc<ConversionPipeline>,
    host: Arc<dyn PlayerHost>,
    embedded: EmbeddedSection,
    alerts: AlertSink,
    include_audio: bool,
}

impl SessionLoader {
    pub fn new(
        resolver: SourceResolver,
        pipeline: Arc<ConversionPipeline>,
        host: Arc<dyn PlayerHost>,
        config: &TandemConfig,
        alerts: AlertSink,
    ) -> Self {
        Self {
            resolver,
            pipeline,
            host,
            embedded: config.embedded.clone(),
            alerts,
            include_audio: true,
        }
    }

    /// Converted outputs keep their audio track unless disabled here.
    pub fn with_audio(mut self, include_audio: bool) -> Self {
        self.include_audio = include_audio;
        self
    }

    /// Everything short of attaching. Runs without borrowing the controller
    /// so the session keeps playing while a conversion is in progress.
    /// Raises one alert on failure.
    pub async fn prepare(&self, side: Side, input: &str) -> Result<PreparedSide, LoadError> {
        match self.try_prepare(side, input).await {
            Ok(prepared) => Ok(prepared),
            Err(err) => {
                self.alerts.raise(Some(side), err.alert_kind(), err.to_string());
                Err(err)
            }
        }
    }

    pub async fn load(
        &self,
        controller: &mut SyncController,
        side: Side,
        input: &str,
    ) -> Result<MediaSource, LoadError> {
        let prepared = self.prepare(side, input).await?;
        Ok(attach(controller, prepared))
    }

    async fn try_prepare(&self, side: Side, input: &str) -> Result<PreparedSide, LoadError> {
        let source = match self.resolver.resolve(input).await? {
            MediaSource::LocalFile { path } if self.pipeline.needs_conversion(&path) => {
                info!(%side, path = %path.display(), "source needs conversion");
                let output = self.pipeline.prepare(&path, self.include_audio).await?;
                MediaSource::local(output)
            }
            other => other,
        };
        let mut transport = if source.is_embedded() {
            Transport::Embedded(EmbeddedTransport::new(
                self.host.embedded_channel(side)?,
                &self.embedded,
            ))
        } else {
            Transport::Native(NativeTransport::new(self.host.native_player(side)?))
        };
        transport.load(&source)?;
        Ok(PreparedSide {
            side,
            source,
            transport,
        })
    }
}

/// Hands a prepared side to the controller and returns its source.
pub fn attach(controller: &mut SyncController, prepared: PreparedSide) -> MediaSource {
    let PreparedSide {
        side,
        source,
        transport,
    } = prepared;
    info!(%side, %source, "side loaded");
    controller.attach(side, transport);
    source
}
