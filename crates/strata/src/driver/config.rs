//! Driver configuration.

use std::path::PathBuf;

use strata_common::LayerPaths;

use crate::filesystem::IdMap;

/// Driver configuration options.
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    /// Root layout of the driver.
    pub paths: LayerPaths,
    /// UID mappings for container root.
    pub uid_maps: Vec<IdMap>,
    /// GID mappings for container root.
    pub gid_maps: Vec<IdMap>,
}

impl DriverConfig {
    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = LayerPaths::with_root(root);
        self
    }

    /// Set the UID mappings.
    #[must_use]
    pub fn with_uid_maps(mut self, maps: Vec<IdMap>) -> Self {
        self.uid_maps = maps;
        self
    }

    /// Set the GID mappings.
    #[must_use]
    pub fn with_gid_maps(mut self, maps: Vec<IdMap>) -> Self {
        self.gid_maps = maps;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DriverConfig::default();
        assert!(config.uid_maps.is_empty());
        assert!(config.gid_maps.is_empty());
        assert_eq!(config.paths, LayerPaths::new());
    }

    #[test]
    fn builder_pattern() {
        let config = DriverConfig::default()
            .with_root("/custom/root")
            .with_uid_maps(vec![IdMap::new(0, 100_000, 65536)])
            .with_gid_maps(vec![IdMap::new(0, 100_000, 65536)]);

        assert_eq!(config.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(config.uid_maps.len(), 1);
        assert_eq!(config.gid_maps[0].host_id, 100_000);
    }
}
