use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::remote::path::normalize;

/// Host alias → bookmarked remote paths.
pub type BookmarkMap = BTreeMap<String, Vec<String>>;

/// Where bookmarks are persisted.
pub trait BookmarkStore: Send + Sync {
    fn load(&self) -> Result<BookmarkMap>;
    fn save(&self, map: &BookmarkMap) -> Result<()>;
}

/// Bookmarks kept as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonBookmarkStore {
    file: PathBuf,
}

impl JsonBookmarkStore {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self { file: file.into() }
    }

    pub fn path(&self) -> &Path {
        &self.file
    }
}

impl BookmarkStore for JsonBookmarkStore {
    fn load(&self) -> Result<BookmarkMap> {
        if !self.file.exists() {
            return Ok(BookmarkMap::new());
        }
        let content = fs::read_to_string(&self.file).context("Failed to read bookmarks file")?;
        serde_json::from_str(&content).context("Failed to parse bookmarks file")
    }

    fn save(&self, map: &BookmarkMap) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent).context("Failed to create bookmarks directory")?;
        }
        let json = serde_json::to_string_pretty(map).context("Failed to serialize bookmarks")?;
        fs::write(&self.file, json).context("Failed to write bookmarks file")?;
        Ok(())
    }
}

/// In-memory bookmarks, saved through the store on every change.
pub struct Bookmarks {
    store: Box<dyn BookmarkStore>,
    map: BookmarkMap,
}

impl Bookmarks {
    /// Load from `store`; an unreadable or corrupt file starts empty.
    pub fn load(store: Box<dyn BookmarkStore>) -> Self {
        let map = store.load().unwrap_or_else(|e| {
            tracing::error!("Failed to load bookmarks, starting empty: {:#}", e);
            BookmarkMap::new()
        });
        Self { store, map }
    }

    pub fn reload(&mut self) {
        match self.store.load() {
            Ok(map) => self.map = map,
            Err(e) => {
                tracing::error!("Failed to reload bookmarks: {:#}", e);
                self.map.clear();
            }
        }
    }

    /// Bookmarks for `host`, sorted.
    pub fn for_host(&self, host: &str) -> Vec<String> {
        let mut paths = self.map.get(host).cloned().unwrap_or_default();
        paths.sort();
        paths
    }

    /// Returns `false` when the path was already bookmarked.
    pub fn add(&mut self, host: &str, path: &str) -> Result<bool> {
        let path = normalize(path);
        if self.map.get(host).is_some_and(|paths| paths.contains(&path)) {
            return Ok(false);
        }
        let previous = self.map.clone();
        self.map.entry(host.to_string()).or_default().push(path);
        self.save_or_restore(previous)?;
        Ok(true)
    }

    /// Returns `false` when the path was not bookmarked.
    pub fn remove(&mut self, host: &str, path: &str) -> Result<bool> {
        let path = normalize(path);
        let Some(paths) = self.map.get(host) else {
            return Ok(false);
        };
        if !paths.contains(&path) {
            return Ok(false);
        }
        let previous = self.map.clone();
        if let Some(paths) = self.map.get_mut(host) {
            paths.retain(|p| *p != path);
        }
        self.save_or_restore(previous)?;
        Ok(true)
    }

    /// Memory never holds a change the store did not accept.
    fn save_or_restore(&mut self, previous: BookmarkMap) -> Result<()> {
        if let Err(e) = self.store.save(&self.map) {
            self.map = previous;
            return Err(e);
        }
        Ok(())
    }
}
