//! Read-only static asset store.
//!
//! Populated once at startup by a recursive directory walk, then shared
//! behind an `Arc` and read concurrently without synchronization. Lookups
//! never touch the filesystem, so request-time path traversal cannot escape
//! the store: a path either is an exact key or it is not.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use bytes::Bytes;
use walkdir::WalkDir;

pub struct AssetStore {
    entries: HashMap<String, Bytes>,
}

impl AssetStore {
    /// Walk `root` recursively and load every file under it, keyed by its
    /// absolute URL path relative to `root` (leading slash, forward slashes).
    pub fn load(root: &Path) -> io::Result<Self> {
        let mut entries = HashMap::new();
        for entry in WalkDir::new(root) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let mut key = String::from("/");
            key.push_str(&rel.to_string_lossy().replace('\\', "/"));
            let bytes = std::fs::read(entry.path())?;
            entries.insert(key, Bytes::from(bytes));
        }
        Ok(Self { entries })
    }

    /// Empty store, for deployments that serve no static files.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&Bytes> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Locate the built application entry bundle under `dir` by filename
    /// convention: the file name starts with `prefix` and ends with `suffix`.
    /// Ties are broken lexicographically so the result is deterministic.
    pub fn find_main_bundle(
        &self,
        dir: &str,
        prefix: &str,
        suffix: &str,
    ) -> Option<(&str, &Bytes)> {
        let dir_prefix = format!("/{}/", dir.trim_matches('/'));
        let mut candidates: Vec<&String> = self
            .entries
            .keys()
            .filter(|key| {
                let Some(rest) = key.strip_prefix(&dir_prefix) else {
                    return false;
                };
                // Direct children only; hashed chunk dirs are not the entry.
                !rest.contains('/') && rest.starts_with(prefix) && rest.ends_with(suffix)
            })
            .collect();
        candidates.sort();
        let key = candidates.first()?;
        Some((key.as_str(), &self.entries[key.as_str()]))
    }
}
