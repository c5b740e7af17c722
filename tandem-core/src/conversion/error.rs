use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use super::types::StrategyKind;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("source {path} cannot be read: {reason}")]
    UnreadableSource { path: PathBuf, reason: String },
    #[error("unsupported container or codec: {0}")]
    UnsupportedContainerOrCodec(String),
    #[error("source {0} has no video stream that can be carried over")]
    NoCompatibleStream(PathBuf),
    #[error("{strategy} failed: {detail}")]
    StrategyFailed {
        strategy: StrategyKind,
        detail: String,
    },
    #[error("every conversion strategy failed:\n{}", render_failures(.failures))]
    Exhausted { failures: Vec<StrategyFailure> },
    #[error("external converter not available: {0}")]
    ExternalToolUnavailable(String),
    #[error("command `{command}` exited with status {status}: {stderr}")]
    Command {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("i/o error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("remux made no progress for {0:?}")]
    Stalled(std::time::Duration),
    #[error("remux exceeded the {0:?} limit")]
    TimedOut(std::time::Duration),
    #[error("media framework error: {0}")]
    Framework(String),
    #[error(transparent)]
    Config(#[from] crate::error::ConfigError),
}

impl ConversionError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Fatal errors abort the strategy chain.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NoCompatibleStream(_))
    }
}

pub type ConversionResult<T> = Result<T, ConversionError>;

/// One recorded failure in the strategy chain.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyFailure {
    pub strategy: StrategyKind,
    pub detail: String,
}

impl StrategyFailure {
    pub fn new(strategy: StrategyKind, error: &ConversionError) -> Self {
        let detail = match error {
            ConversionError::StrategyFailed { detail, .. } => detail.clone(),
            other => other.to_string(),
        };
        Self { strategy, detail }
    }
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.detail)
    }
}

fn render_failures(failures: &[StrategyFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
