use crate::config::Settings;
use crate::media_url;
use crate::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const AUDIO_EXTENSION: &str = "mp3";

/// File cache keyed by URL. The file's modification time is its last-use stamp.
#[derive(Debug, Clone)]
pub struct ContentCache {
    root: PathBuf,
    max_age: Duration,
    max_count: usize,
    reuse: bool,
}

impl ContentCache {
    pub fn new(root: PathBuf, max_age: Duration, max_count: usize, reuse: bool) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        tracing::info!(
            path = %root.display(),
            max_age_secs = max_age.as_secs(),
            max_count,
            reuse,
            "media cache initialized"
        );
        Ok(Self {
            root,
            max_age,
            max_count,
            reuse,
        })
    }

    pub fn from_settings(root: PathBuf, settings: &Settings) -> Result<Self> {
        Self::new(
            root,
            settings.cache_max_age(),
            settings.cache_max_count,
            settings.cache_reuse_enabled,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for_url(&self, url: &str) -> PathBuf {
        self.root
            .join(format!("{}.{AUDIO_EXTENSION}", stable_id(url)))
    }

    /// Path of a fresh cached copy of `url`, if reuse is enabled and one exists.
    pub fn try_get_valid(&self, url: &str) -> Option<PathBuf> {
        if !self.reuse {
            return None;
        }
        let path = self.path_for_url(url);
        let modified = match std::fs::metadata(&path)
            .ok()
            .filter(|m| m.is_file())
            .and_then(|m| m.modified().ok())
        {
            Some(v) => v,
            None => {
                tracing::debug!(url, "cache miss (file not found)");
                return None;
            }
        };

        if age_of(modified) <= self.max_age {
            tracing::info!(url, path = %path.display(), "cache hit");
            Some(path)
        } else {
            tracing::info!(url, "cache miss (file expired)");
            None
        }
    }

    /// Marks `path` as just used and enforces the entry limit. Never fails.
    pub fn touch(&self, path: &Path) {
        if !path.exists() {
            return;
        }
        if let Err(e) = filetime::set_file_mtime(path, filetime::FileTime::now()) {
            tracing::warn!(path = %path.display(), error = %e, "failed to touch cache entry");
            return;
        }
        self.cleanup_over_capacity();
    }

    /// Deletes every entry older than the max age. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0_usize;
        for (path, modified) in self.entries() {
            if age_of(modified) <= self.max_age {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(path = %path.display(), "deleted expired cache entry");
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "could not delete expired entry");
                }
            }
        }
        removed
    }

    /// Keeps the `max_count` most recently used entries and deletes the rest.
    pub fn cleanup_over_capacity(&self) -> usize {
        if self.max_count == 0 {
            return 0;
        }
        let mut entries = self.entries();
        if entries.len() <= self.max_count {
            return 0;
        }

        tracing::info!(
            count = entries.len(),
            limit = self.max_count,
            "cache over capacity, evicting least recently used entries"
        );
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        let mut removed = 0_usize;
        for (path, _) in entries.into_iter().skip(self.max_count) {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(path = %path.display(), "deleted over-capacity cache entry");
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "could not evict entry");
                }
            }
        }
        removed
    }

    /// Top-level files with their modification times. Entries that vanish
    /// mid-scan are skipped.
    fn entries(&self) -> Vec<(PathBuf, SystemTime)> {
        let dir = match std::fs::read_dir(&self.root) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        for entry in dir {
            let entry = match entry {
                Ok(v) => v,
                Err(_) => continue,
            };
            let meta = match entry.metadata() {
                Ok(v) => v,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((entry.path(), modified));
        }
        out
    }
}

/// Cache key for `url`: the platform video id when there is one, otherwise a
/// lowercase SHA-256 of the trimmed URL.
pub fn stable_id(url: &str) -> String {
    if let Some(id) = media_url::youtube_video_id(url) {
        return id;
    }
    let mut hasher = Sha256::new();
    hasher.update(url.trim().as_bytes());
    hex::encode(hasher.finalize())
}

fn age_of(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO)
}
