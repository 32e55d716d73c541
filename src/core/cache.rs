use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use crate::core::error::Result;

pub const CACHE_FILE: &str = "tuning_cache.json";

/// `$HOME/.ptxtune` (or `%USERPROFILE%`), falling back to the working directory.
pub fn default_cache_dir() -> PathBuf {
    let mut path = if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home)
    } else if let Ok(home) = std::env::var("USERPROFILE") {
        PathBuf::from(home)
    } else {
        PathBuf::from(".")
    };
    path.push(".ptxtune");
    path
}

#[derive(Serialize, Deserialize, Default)]
struct ResultCacheFile {
    entries: HashMap<String, Value>,
}

/// Tuning results persisted as one JSON document keyed by hex hash strings.
///
/// A missing or unreadable file behaves as an empty cache, and an entry that no longer
/// deserializes is treated as a miss.
#[derive(Debug)]
pub struct ResultCache {
    path: PathBuf,
    entries: HashMap<String, Value>,
}

impl ResultCache {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = fs::read_to_string(&path)
            .ok()
            .and_then(|s| match serde_json::from_str::<ResultCacheFile>(&s) {
                Ok(file) => Some(file.entries),
                Err(e) => {
                    warn!("[Cache] ignoring unreadable cache {}: {}", path.display(), e);
                    None
                }
            })
            .unwrap_or_default();
        Self { path, entries }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::open(dir.join(CACHE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.entries.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!("[Cache] stale entry {}: {}", key, e);
                None
            }
        }
    }

    /// Inserts and rewrites the file, creating the directory if needed.
    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        self.entries.insert(key.to_string(), serde_json::to_value(value)?);
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let file = ResultCacheFile { entries: self.entries.clone() };
        fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}
