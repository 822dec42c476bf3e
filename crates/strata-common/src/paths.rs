//! On-disk layout of a driver root.
//!
//! ```text
//! <root>/layers/<id>   parent chain record
//! <root>/diff/<id>/    layer content
//! <root>/mnt/<id>/     union mount point
//! ```

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default root directory for the aufs driver.
pub static STRATA_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("STRATA_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/strata/aufs"))
});

const LAYERS_DIR: &str = "layers";
const DIFF_DIR: &str = "diff";
const MNT_DIR: &str = "mnt";
const REMOVING_SUFFIX: &str = "-removing";

/// Paths used by a driver rooted at a single base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPaths {
    /// Driver root directory.
    pub root: PathBuf,
}

impl LayerPaths {
    /// Create paths with the default root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one parent-chain record per layer.
    #[must_use]
    pub fn layers(&self) -> PathBuf {
        self.root.join(LAYERS_DIR)
    }

    /// Directory holding layer contents.
    #[must_use]
    pub fn diff(&self) -> PathBuf {
        self.root.join(DIFF_DIR)
    }

    /// Directory holding mount points.
    #[must_use]
    pub fn mnt(&self) -> PathBuf {
        self.root.join(MNT_DIR)
    }

    /// Parent-chain record for a layer.
    #[must_use]
    pub fn layer_record(&self, id: &str) -> PathBuf {
        self.layers().join(id)
    }

    /// Content directory for a layer.
    #[must_use]
    pub fn diff_dir(&self, id: &str) -> PathBuf {
        self.diff().join(id)
    }

    /// Mount point for a layer.
    #[must_use]
    pub fn mount_point(&self, id: &str) -> PathBuf {
        self.mnt().join(id)
    }

    /// Name a layer directory takes while it is being deleted.
    ///
    /// The returned path is a sibling of `id` inside `parent`.
    #[must_use]
    pub fn removing(parent: &Path, id: &str) -> PathBuf {
        parent.join(format!("{id}{REMOVING_SUFFIX}"))
    }

    /// The three per-root subdirectories.
    #[must_use]
    pub fn subdirs(&self) -> [PathBuf; 3] {
        [self.mnt(), self.diff(), self.layers()]
    }
}

impl Default for LayerPaths {
    fn default() -> Self {
        Self {
            root: STRATA_ROOT.clone(),
        }
    }
}
