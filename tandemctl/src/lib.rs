use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tandem_core::{
    load_tandem_config, CacheEntry, ConversionError, ConversionOutcome, ConversionPipeline,
    FfmpegFramework, MediaSource, ProbeReport, ResolveError, SourceResolver, SystemCommandExecutor,
    TandemConfig,
};
use thiserror::Error;
use tracing::warn;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] tandem_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),
    #[error("resolution error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Tandem media toolbox", long_about = None)]
pub struct Cli {
    /// Path to tandem.toml; built-in defaults are used when it does not exist
    #[arg(long, default_value = "configs/tandem.toml")]
    pub config: PathBuf,
    /// Override for conversion.cache_dir
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Converts a local file into a natively playable container
    Convert(ConvertArgs),
    /// Lists the tracks ffprobe reports for a file
    Probe(ProbeArgs),
    /// Conversion cache maintenance
    #[command(subcommand)]
    Cache(CacheCommands),
    /// Classifies an input as local file, direct URL or provider video
    Resolve(ResolveArgs),
    /// Checks configuration and external tools
    Health,
}

#[derive(Args, Debug)]
pub struct ConvertArgs {
    pub file: PathBuf,
    /// Drop the audio track from the converted output
    #[arg(long, default_value_t = false)]
    pub no_audio: bool,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Local path, file:// URL or http(s) URL
    pub input: String,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Lists cached conversions
    List,
    /// Deletes cached conversions
    Purge(CachePurgeArgs),
}

#[derive(Args, Debug)]
pub struct CachePurgeArgs {
    /// Only delete outputs that no longer verify as playable
    #[arg(long, default_value_t = false)]
    pub invalid_only: bool,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match &cli.command {
        Commands::Convert(args) => {
            let report = runtime.block_on(context.convert(args))?;
            render(&report, cli.format)?;
        }
        Commands::Probe(args) => {
            let report = runtime.block_on(context.probe(&args.file))?;
            render(&report, cli.format)?;
        }
        Commands::Cache(CacheCommands::List) => {
            let listing = context.cache_list()?;
            render(&listing, cli.format)?;
        }
        Commands::Cache(CacheCommands::Purge(args)) => {
            let result = runtime.block_on(context.cache_purge(args))?;
            render(&result, cli.format)?;
        }
        Commands::Resolve(args) => {
            let report = runtime.block_on(context.resolve(&args.input))?;
            render(&report, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: TandemConfig,
    config_path: PathBuf,
    config_found: bool,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config_found = config_path.exists();
        let mut config = if config_found {
            load_tandem_config(&config_path)?
        } else {
            warn!(path = %config_path.display(), "config file not found, using defaults");
            TandemConfig::default()
        };
        if let Some(dir) = &cli.cache_dir {
            config.conversion.cache_dir = dir.clone();
        }
        Ok(Self {
            config,
            config_path,
            config_found,
        })
    }

    fn pipeline(&self) -> Result<ConversionPipeline> {
        Ok(ConversionPipeline::from_config(
            &self.config,
            Arc::new(SystemCommandExecutor),
        )?)
    }

    fn framework(&self) -> FfmpegFramework {
        FfmpegFramework::new(Arc::new(SystemCommandExecutor), &self.config)
    }

    async fn convert(&self, args: &ConvertArgs) -> Result<ConvertReport> {
        let pipeline = self.pipeline()?;
        let outcome = pipeline.convert_path(&args.file, !args.no_audio).await?;
        Ok(ConvertReport::new(&args.file, outcome))
    }

    async fn probe(&self, file: &Path) -> Result<ProbeView> {
        let report = self.framework().probe(file).await?;
        Ok(ProbeView {
            file: file.to_path_buf(),
            playable: report.is_playable(),
            report,
        })
    }

    fn cache_list(&self) -> Result<CacheListing> {
        let pipeline = self.pipeline()?;
        let cache = pipeline.cache();
        Ok(CacheListing {
            dir: cache.dir().to_path_buf(),
            entries: cache.entries()?,
        })
    }

    async fn cache_purge(&self, args: &CachePurgeArgs) -> Result<PurgeResult> {
        let pipeline = self.pipeline()?;
        let cache = pipeline.cache();
        let removed = if args.invalid_only {
            cache.purge_invalid(pipeline.framework().as_ref()).await?
        } else {
            cache.purge_all().await?
        };
        Ok(PurgeResult {
            dir: cache.dir().to_path_buf(),
            invalid_only: args.invalid_only,
            removed,
        })
    }

    async fn resolve(&self, input: &str) -> Result<ResolveReport> {
        let resolver = SourceResolver::from_config(&self.config.resolver)?;
        let source = resolver.resolve(input).await?;
        Ok(ResolveReport {
            input: input.to_string(),
            embedded: source.is_embedded(),
            needs_conversion: match &source {
                MediaSource::LocalFile { path } => self.pipeline()?.needs_conversion(path),
                _ => false,
            },
            source,
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(if self.config_found {
            HealthEntry::ok("tandem.toml", format!("{}", self.config_path.display()))
        } else {
            HealthEntry::warn(
                "tandem.toml",
                format!("{} missing, using defaults", self.config_path.display()),
            )
        });
        results.push(self.check_cache_dir(&self.config.conversion.cache_dir));

        let external = &self.config.external;
        results.push(self.check_tool("ffprobe", &external.ffprobe_path, true));
        results.push(self.check_tool("ffmpeg", &external.ffmpeg_path, external.enabled));
        results.push(if cfg!(feature = "embedded-remux") {
            HealthEntry::ok("embedded remux", "in-process stream copy available")
        } else {
            HealthEntry::warn(
                "embedded remux",
                "not compiled in, stream copy falls back to export",
            )
        });
        results
    }

    fn check_cache_dir(&self, path: &Path) -> HealthEntry {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok("cache dir", format!("{}", path.display())),
            Ok(_) => HealthEntry::error(
                "cache dir",
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(
                "cache dir",
                format!("{path} will be created on first conversion", path = path.display()),
            ),
        }
    }

    fn check_tool(&self, name: &str, configured: &str, required: bool) -> HealthEntry {
        match tandem_core::process::locate_executable(configured, &self.config.external.search_paths)
        {
            Some(path) => HealthEntry::ok(name, format!("{}", path.display())),
            None if required => HealthEntry::error(name, format!("{configured} not found")),
            None => HealthEntry::warn(name, format!("{configured} not found (disabled)")),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConvertReport {
    pub source: PathBuf,
    pub output: PathBuf,
    pub key: String,
    pub strategy: Option<String>,
    pub reused_cache: bool,
    pub failed_attempts: Vec<String>,
    pub elapsed_ms: u128,
}

impl ConvertReport {
    fn new(source: &Path, outcome: ConversionOutcome) -> Self {
        Self {
            source: source.to_path_buf(),
            output: outcome.output,
            key: outcome.key,
            strategy: outcome.strategy.map(|s| s.to_string()),
            reused_cache: outcome.reused_cache,
            failed_attempts: outcome
                .failures_before_success
                .iter()
                .map(ToString::to_string)
                .collect(),
            elapsed_ms: outcome.elapsed.as_millis(),
        }
    }
}

impl DisplayFallback for ConvertReport {
    fn display(&self) -> String {
        let how = match (&self.strategy, self.reused_cache) {
            (_, true) => "reused from cache".to_string(),
            (Some(strategy), false) => format!("via {strategy}"),
            (None, false) => "strategy unknown".to_string(),
        };
        let mut lines = vec![
            format!("{} -> {}", self.source.display(), self.output.display()),
            format!("  {how} in {} ms", self.elapsed_ms),
        ];
        for failure in &self.failed_attempts {
            lines.push(format!("  - {failure}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ProbeView {
    pub file: PathBuf,
    pub playable: bool,
    #[serde(flatten)]
    pub report: ProbeReport,
}

impl DisplayFallback for ProbeView {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} ({}, {})",
            self.file.display(),
            self.report.format_name.as_deref().unwrap_or("unknown format"),
            self.report
                .duration_seconds
                .map(|d| format!("{d:.2} s"))
                .unwrap_or_else(|| "no duration".to_string())
        )];
        for track in &self.report.tracks {
            let mut line = format!("  #{} {:?} {}", track.index, track.kind, track.codec);
            if let (Some(w), Some(h)) = (track.width, track.height) {
                line.push_str(&format!(" {w}x{h}"));
            }
            if let Some(language) = &track.language {
                line.push_str(&format!(" [{language}]"));
            }
            lines.push(line);
        }
        if !self.playable {
            lines.push("  not playable as-is".to_string());
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CacheListing {
    pub dir: PathBuf,
    pub entries: Vec<CacheEntry>,
}

impl DisplayFallback for CacheListing {
    fn display(&self) -> String {
        if self.entries.is_empty() {
            return format!("No cached conversions in {}.", self.dir.display());
        }
        let mut lines = vec![format!("Cache: {}", self.dir.display())];
        for entry in &self.entries {
            let origin = entry
                .manifest
                .as_ref()
                .map(|m| format!("{} ({})", m.source.display(), m.strategy))
                .unwrap_or_else(|| "no manifest".to_string());
            lines.push(format!(
                "  - {} {:.1} MiB {}",
                entry.key,
                entry.size_bytes as f64 / (1024.0 * 1024.0),
                origin
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct PurgeResult {
    pub dir: PathBuf,
    pub invalid_only: bool,
    pub removed: usize,
}

impl DisplayFallback for PurgeResult {
    fn display(&self) -> String {
        let scope = if self.invalid_only { "invalid " } else { "" };
        format!(
            "Removed {} {scope}file(s) from {}",
            self.removed,
            self.dir.display()
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ResolveReport {
    pub input: String,
    pub source: MediaSource,
    pub embedded: bool,
    pub needs_conversion: bool,
}

impl DisplayFallback for ResolveReport {
    fn display(&self) -> String {
        let kind = match &self.source {
            MediaSource::LocalFile { .. } if self.needs_conversion => "local file (needs conversion)",
            MediaSource::LocalFile { .. } => "local file",
            MediaSource::DirectUrl { .. } => "direct url",
            MediaSource::Provider { .. } => "provider video (embedded player)",
        };
        format!("{kind}: {}", self.source)
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(DisplayFallback::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!(
            "[{status}] {name}: {detail}",
            status = self.status,
            name = self.name,
            detail = self.detail
        )
    }
}
