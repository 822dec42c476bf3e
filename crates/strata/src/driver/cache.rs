//! Resolved content paths per layer.

use std::path::PathBuf;

use dashmap::DashMap;

/// Concurrent map from layer ID to the path last handed out for it.
///
/// Entries are only ever dropped when the layer is removed.
#[derive(Debug, Default)]
pub struct PathCache {
    paths: DashMap<String, PathBuf>,
}

impl PathCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached path for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<PathBuf> {
        self.paths.get(id).map(|entry| entry.value().clone())
    }

    /// Cached path for `id`, caching `default` first if there is none.
    pub fn get_or_insert(&self, id: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
        self.paths.entry(id.to_string()).or_insert_with(default).value().clone()
    }

    /// Cache `path` for `id`.
    pub fn insert(&self, id: &str, path: PathBuf) {
        self.paths.insert(id.to_string(), path);
    }

    /// Forget `id`.
    pub fn remove(&self, id: &str) -> Option<PathBuf> {
        self.paths.remove(id).map(|(_, path)| path)
    }

    /// Number of cached layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
