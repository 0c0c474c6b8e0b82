use crate::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundEntry {
    /// Commands that trigger this entry.
    pub name: Vec<String>,
    /// Files relative to the sounds directory.
    pub sounds: Vec<String>,
}

/// Named clips from `sounds/sounds.json`.
#[derive(Debug, Clone, Default)]
pub struct SoundBoard {
    dir: PathBuf,
    entries: Vec<SoundEntry>,
}

impl SoundBoard {
    pub fn new(dir: PathBuf, entries: Vec<SoundEntry>) -> Self {
        Self { dir, entries }
    }

    /// Loads the board. A missing file gives an empty board.
    pub fn load(config_path: &Path) -> Result<Self> {
        let dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        if !config_path.exists() {
            tracing::info!(path = %config_path.display(), "no sound board configured");
            return Ok(Self::new(dir, Vec::new()));
        }
        let bytes = std::fs::read(config_path)?;
        let entries: Vec<SoundEntry> = serde_json::from_slice(&bytes)?;
        tracing::info!(entries = entries.len(), "sound board loaded");
        Ok(Self::new(dir, entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .flat_map(|e| e.name.iter().map(String::as_str))
    }

    /// Picks the file for `command`.
    ///
    /// `index` is 1-based; values below 1 mean the first sound. Without an
    /// index every sound of the entry is equally likely.
    pub fn resolve(&self, command: &str, index: Option<usize>) -> Option<PathBuf> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name.iter().any(|n| n == command))?;
        let count = entry.sounds.len();
        let chosen = match (count, index) {
            (0, _) => return None,
            (1, _) => 0,
            (_, Some(i)) => {
                let i = i.max(1) - 1;
                if i >= count {
                    return None;
                }
                i
            }
            (_, None) => rand::thread_rng().gen_range(0..count),
        };
        Some(self.dir.join(&entry.sounds[chosen]))
    }
}
