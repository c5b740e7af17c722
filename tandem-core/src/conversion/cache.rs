use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::error::{ConversionError, ConversionResult};
use super::framework::MediaFramework;
use super::types::{ConversionRequest, StrategyKind};

const PARTIAL_MARKER: &str = ".partial.";

/// Hash of the source identity. Any change in path, size or modification
/// time yields a new key.
pub fn identity_key(path: &Path, size: u64, modified: SystemTime) -> String {
    let nanos: i128 = match modified.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_nanos() as i128,
        Err(before) => -(before.duration().as_nanos() as i128),
    };
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(size.to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    hex_encode(hasher.finalize())
}

/// Sidecar written next to every cached output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub key: String,
    pub source: PathBuf,
    pub source_size: u64,
    pub source_modified: DateTime<Utc>,
    pub strategy: StrategyKind,
    pub created_at: DateTime<Utc>,
}

impl CacheManifest {
    pub fn new(key: &str, request: &ConversionRequest, strategy: StrategyKind) -> Self {
        Self {
            key: key.to_string(),
            source: request.source.clone(),
            source_size: request.size,
            source_modified: DateTime::<Utc>::from(request.modified),
            strategy,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub output: PathBuf,
    pub size_bytes: u64,
    pub manifest: Option<CacheManifest>,
}

/// Converted outputs keyed by source identity.
#[derive(Debug, Clone)]
pub struct ConversionCache {
    dir: PathBuf,
    extension: String,
}

impl ConversionCache {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn output_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{}", self.extension))
    }

    /// Scratch output for one attempt. Swept by the purge operations.
    pub fn partial_path(&self, key: &str, label: &str) -> PathBuf {
        self.dir
            .join(format!("{key}{PARTIAL_MARKER}{label}.{}", self.extension))
    }

    pub fn manifest_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub async fn ensure_dir(&self) -> ConversionResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| ConversionError::io(&self.dir, err))
    }

    /// Existing output for `key`, without verification.
    pub async fn existing(&self, key: &str) -> Option<PathBuf> {
        let path = self.output_path(key);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Some(path),
            _ => None,
        }
    }

    pub async fn manifest(&self, key: &str) -> Option<CacheManifest> {
        let raw = fs::read(self.manifest_path(key)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Moves a verified attempt into place and writes its manifest.
    pub async fn commit(
        &self,
        key: &str,
        produced: &Path,
        manifest: &CacheManifest,
    ) -> ConversionResult<PathBuf> {
        let output = self.output_path(key);
        fs::rename(produced, &output)
            .await
            .map_err(|err| ConversionError::io(produced, err))?;
        let manifest_path = self.manifest_path(key);
        let payload = serde_json::to_vec_pretty(manifest)
            .map_err(|err| ConversionError::Framework(format!("manifest encoding: {err}")))?;
        fs::write(&manifest_path, payload)
            .await
            .map_err(|err| ConversionError::io(&manifest_path, err))?;
        Ok(output)
    }

    pub async fn remove(&self, key: &str) -> ConversionResult<()> {
        for path in [self.output_path(key), self.manifest_path(key)] {
            remove_if_present(&path).await?;
        }
        Ok(())
    }

    pub fn entries(&self) -> ConversionResult<Vec<CacheEntry>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|err| {
                let path = err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.dir.clone());
                ConversionError::io(path, std::io::Error::other(err.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.contains(PARTIAL_MARKER) {
                continue;
            }
            let Some(key) = name.strip_suffix(&format!(".{}", self.extension)) else {
                continue;
            };
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let manifest = std::fs::read(self.manifest_path(key))
                .ok()
                .and_then(|raw| serde_json::from_slice(&raw).ok());
            entries.push(CacheEntry {
                key: key.to_string(),
                output: path.to_path_buf(),
                size_bytes,
                manifest,
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Deletes every cached output, manifest and leftover partial file.
    pub async fn purge_all(&self) -> ConversionResult<usize> {
        let mut removed = 0;
        for entry in self.entries()? {
            self.remove(&entry.key).await?;
            removed += 1;
        }
        removed += self.remove_partials().await?;
        info!(removed, dir = %self.dir.display(), "conversion cache purged");
        Ok(removed)
    }

    /// Re-verifies every cached output and deletes those that fail.
    pub async fn purge_invalid(&self, framework: &dyn MediaFramework) -> ConversionResult<usize> {
        let mut removed = 0;
        for entry in self.entries()? {
            if framework.verify_playable(&entry.output).await {
                continue;
            }
            warn!(key = %entry.key, "cached output no longer playable, removing");
            self.remove(&entry.key).await?;
            removed += 1;
        }
        removed += self.remove_partials().await?;
        Ok(removed)
    }

    pub async fn remove_partials(&self) -> ConversionResult<usize> {
        self.remove_partials_matching("").await
    }

    /// Removes partial files whose name starts with `prefix`.
    pub async fn remove_partials_matching(&self, prefix: &str) -> ConversionResult<usize> {
        let mut reader = match fs::read_dir(&self.dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(ConversionError::io(&self.dir, err)),
        };
        let mut removed = 0;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| ConversionError::io(&self.dir, err))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(prefix) && name.contains(PARTIAL_MARKER) {
                remove_if_present(&entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

async fn remove_if_present(path: &Path) -> ConversionResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ConversionError::io(path, err)),
    }
}
