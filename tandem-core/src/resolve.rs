//! Classifies user input into something a transport can load.
//!
//! Local paths stay local, URLs on a recognized embeddable provider become a
//! provider video id, and any other HTTP(S) URL is handed to a
//! [`UrlResolver`] which must produce a direct media URL.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::config::ResolverSection;
use crate::transport::MediaSource;

pub const PROVIDER_NAME: &str = "youtube";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("not a valid provider url: {0}")]
    InvalidProviderUrl(String),
    #[error("network unreachable or timed out: {0}")]
    NetworkUnreachableOrTimedOut(String),
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),
    #[error("file not found: {0}")]
    MissingFile(PathBuf),
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Turns an arbitrary HTTP(S) URL into a URL the native player can stream.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn resolve(&self, url: &Url) -> ResolveResult<Url>;
}

/// Extracts video ids from the provider's URL shapes.
#[derive(Debug, Clone)]
pub struct ProviderRecognizer {
    hosts: Vec<String>,
    id_pattern: Regex,
}

impl ProviderRecognizer {
    pub fn new(hosts: &[String]) -> Self {
        Self {
            hosts: hosts.iter().map(|h| h.to_ascii_lowercase()).collect(),
            id_pattern: Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid regex"),
        }
    }

    pub fn is_provider_host(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| {
                let host = host.to_ascii_lowercase();
                self.hosts.iter().any(|candidate| *candidate == host)
            })
            .unwrap_or(false)
    }

    /// Video id of a provider URL; `None` for unrecognized shapes.
    pub fn video_id(&self, url: &Url) -> Option<String> {
        if !self.is_provider_host(url) {
            return None;
        }
        let host = url.host_str()?.to_ascii_lowercase();
        let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
        let candidate = if host == "youtu.be" {
            segments.next().map(str::to_string)
        } else {
            match segments.next() {
                Some("watch") => url
                    .query_pairs()
                    .find(|(name, _)| name == "v")
                    .map(|(_, value)| value.into_owned()),
                Some("embed" | "shorts" | "live" | "v") => segments.next().map(str::to_string),
                _ => None,
            }
        };
        candidate.filter(|id| self.id_pattern.is_match(id))
    }
}

/// [`UrlResolver`] that accepts URLs already pointing at media, judged by
/// the `Content-Type` of a `HEAD` request.
#[derive(Debug, Clone)]
pub struct HttpUrlResolver {
    client: Client,
}

impl HttpUrlResolver {
    pub fn new(config: &ResolverSection) -> ResolveResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()
            .map_err(|err| ResolveError::UnsupportedSource(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn is_media_type(content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        essence.starts_with("video/")
            || essence.starts_with("audio/")
            || essence == "application/vnd.apple.mpegurl"
            || essence == "application/x-mpegurl"
    }
}

#[async_trait]
impl UrlResolver for HttpUrlResolver {
    async fn resolve(&self, url: &Url) -> ResolveResult<Url> {
        let response = self.client.head(url.clone()).send().await.map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                ResolveError::NetworkUnreachableOrTimedOut(err.to_string())
            } else {
                ResolveError::UnsupportedSource(err.to_string())
            }
        })?;
        if !response.status().is_success() {
            return Err(ResolveError::UnsupportedSource(format!(
                "{url} answered {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !Self::is_media_type(&content_type) {
            return Err(ResolveError::UnsupportedSource(format!(
                "{url} is not media (content type `{content_type}`)"
            )));
        }
        Ok(response.url().clone())
    }
}

pub struct SourceResolver {
    recognizer: ProviderRecognizer,
    resolver: Arc<dyn UrlResolver>,
}

impl std::fmt::Debug for SourceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceResolver")
            .field("recognizer", &self.recognizer)
            .finish()
    }
}

impl SourceResolver {
    pub fn new(recognizer: ProviderRecognizer, resolver: Arc<dyn UrlResolver>) -> Self {
        Self {
            recognizer,
            resolver,
        }
    }

    pub fn from_config(config: &ResolverSection) -> ResolveResult<Self> {
        Ok(Self::new(
            ProviderRecognizer::new(&config.providers),
            Arc::new(HttpUrlResolver::new(config)?),
        ))
    }

    pub fn recognizer(&self) -> &ProviderRecognizer {
        &self.recognizer
    }

    pub async fn resolve(&self, input: &str) -> ResolveResult<MediaSource> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ResolveError::UnsupportedSource("empty input".into()));
        }
        match Url::parse(input) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => self.resolve_url(url).await,
            Ok(url) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| ResolveError::UnsupportedSource(input.to_string()))?;
                local_source(path).await
            }
            // Windows drive letters parse as one-letter schemes.
            Ok(url) if url.scheme().len() > 1 => Err(ResolveError::UnsupportedSource(format!(
                "unsupported scheme `{}`",
                url.scheme()
            ))),
            _ => local_source(PathBuf::from(input)).await,
        }
    }

    async fn resolve_url(&self, url: Url) -> ResolveResult<MediaSource> {
        if self.recognizer.is_provider_host(&url) {
            let video_id = self
                .recognizer
                .video_id(&url)
                .ok_or_else(|| ResolveError::InvalidProviderUrl(url.to_string()))?;
            debug!(%url, video_id, "recognized provider url");
            return Ok(MediaSource::Provider {
                provider: PROVIDER_NAME.to_string(),
                video_id,
            });
        }
        let resolved = self.resolver.resolve(&url).await?;
        info!(input = %url, resolved = %resolved, "resolved direct media url");
        Ok(MediaSource::DirectUrl { url: resolved })
    }
}

async fn local_source(path: PathBuf) -> ResolveResult<MediaSource> {
    match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => Ok(MediaSource::local(path)),
        Ok(_) => Err(ResolveError::UnsupportedSource(format!(
            "{} is not a file",
            path.display()
        ))),
        Err(_) => Err(ResolveError::MissingFile(path)),
    }
}
