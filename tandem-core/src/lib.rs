pub mod config;
pub mod conversion;
pub mod error;
pub mod process;
pub mod resolve;
pub mod session;
pub mod sync;
pub mod transport;

pub use config::{
    load_tandem_config, ConversionSection, EmbeddedSection, ExternalSection, ResolverSection,
    SyncSection, TandemConfig,
};
pub use conversion::{
    identity_key, CacheEntry, CacheManifest, ConversionCache, ConversionError, ConversionOutcome,
    ConversionPipeline, ConversionProgress, ConversionRequest, ConversionResult, ExportPreset,
    ExternalConverter, FfmpegFramework, MediaFramework, ProbeReport, ProgressReporter,
    StrategyFailure, StrategyKind, TimestampNormalizer, TrackInfo, TrackKind,
};
pub use error::{ConfigError, Result};
pub use process::{CommandExecutor, SystemCommandExecutor};
pub use resolve::{
    HttpUrlResolver, ProviderRecognizer, ResolveError, ResolveResult, SourceResolver, UrlResolver,
};
pub use session::{LoadError, PlayerHost, PreparedSide, SessionLoader};
pub use sync::{
    reaction_target, AlertKind, AlertSink, Correction, DriftPolicy, Offset, SessionAlert,
    SyncController, Timeline,
};
pub use transport::{
    BridgeCommand, BridgeMessage, EmbeddedBridge, EmbeddedState, EmbeddedTransport, MediaSource,
    NativePlayer, NativeTransport, PlaybackStatus, SeekCompletion, Side, SideEvent, Transport,
    TransportError, TransportEvent, TransportKind, TransportResult,
};
