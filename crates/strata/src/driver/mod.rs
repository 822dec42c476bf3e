//! The aufs layer driver.
//!
//! ```text
//! <root>
//! ├── layers   one record per layer: its ancestors, nearest first
//! ├── diff     each layer's own content, used as a union branch
//! └── mnt      mount points for layers with ancestors
//! ```

mod cache;
mod config;
mod remove;
mod state;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_common::id::truncate_id;
use strata_common::{LayerId, LayerPaths, StrataError, StrataResult};

use crate::filesystem::archive::{self, Change};
use crate::filesystem::ownership::{IdMappings, make_dir_all_as, root_ids};
use crate::filesystem::union::AUFS;
use crate::filesystem::{
    DIRPERM1_PROBE, FeatureProbe, FsMagic, HostMounter, LayerStore, MountMode, Mounter, ParentChain,
};

pub use cache::PathCache;
pub use config::DriverConfig;
pub use remove::Retired;
pub use state::MountState;

/// Registration name of the driver.
pub const DRIVER_NAME: &str = "aufs";

/// Mode of the driver root and its subdirectories.
const ROOT_DIR_MODE: u32 = 0o700;

/// Layer driver composing image layers with aufs.
#[derive(Debug)]
pub struct Driver {
    /// Layer records and directories.
    store: LayerStore,
    /// Mount transitions.
    mounts: MountState,
    /// Paths handed out by [`Driver::get`].
    cache: PathCache,
    /// Host mount table.
    mounter: Arc<dyn Mounter>,
    /// Filesystem the root lives on.
    backing_fs: FsMagic,
    /// Owner translation for archives.
    id_mappings: IdMappings,
}

impl Driver {
    /// Initialize the driver on the host kernel.
    ///
    /// # Errors
    ///
    /// Fails with [`StrataError::NotSupported`] if aufs is unavailable and
    /// with [`StrataError::IncompatibleBackingFilesystem`] if the root sits
    /// on a filesystem aufs cannot stack.
    pub fn init(config: DriverConfig) -> StrataResult<Self> {
        Self::init_with(config, Arc::new(HostMounter), DIRPERM1_PROBE.clone())
    }

    /// Initialize the driver with an explicit mounter and feature probe.
    pub fn init_with(
        config: DriverConfig,
        mounter: Arc<dyn Mounter>,
        probe: Arc<FeatureProbe>,
    ) -> StrataResult<Self> {
        match mounter.filesystem_supported(AUFS) {
            Ok(true) => {}
            Ok(false) => return Err(StrataError::NotSupported),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to query supported filesystems");
                return Err(StrataError::NotSupported);
            }
        }

        let paths = config.paths;
        let owner = root_ids(&config.uid_maps, &config.gid_maps)?;
        make_dir_all_as(&paths.root, ROOT_DIR_MODE, owner)?;

        let backing_fs = mounter.fs_magic(&paths.root)?;
        if backing_fs.is_incompatible() {
            return Err(StrataError::IncompatibleBackingFilesystem {
                fs_name: backing_fs.to_string(),
            });
        }

        let id_mappings = IdMappings::new(config.uid_maps, config.gid_maps);

        make_private(mounter.as_ref(), &paths.root)?;
        for dir in paths.subdirs() {
            make_dir_all_as(&dir, ROOT_DIR_MODE, owner)?;
        }

        tracing::info!(
            root = %paths.root.display(),
            backing_fs = %backing_fs,
            "aufs driver initialized"
        );

        Ok(Self {
            store: LayerStore::new(paths.clone(), owner),
            mounts: MountState::new(mounter.clone(), paths, probe),
            cache: PathCache::new(),
            mounter,
            backing_fs,
            id_mappings,
        })
    }

    /// The root layout.
    #[must_use]
    pub fn paths(&self) -> &LayerPaths {
        self.store.paths()
    }

    /// Create a layer on top of `parent` (empty for a base layer).
    pub fn create(
        &self,
        id: &str,
        parent: &str,
        storage_opts: &HashMap<String, String>,
    ) -> StrataResult<()> {
        let id = LayerId::new(id)?;
        let parent = if parent.is_empty() {
            None
        } else {
            Some(LayerId::new(parent)?)
        };

        self.store.create(&id, parent.as_ref(), storage_opts)?;
        Ok(())
    }

    /// Create the writable layer of a container.
    pub fn create_read_write(
        &self,
        id: &str,
        parent: &str,
        storage_opts: &HashMap<String, String>,
    ) -> StrataResult<()> {
        self.create(id, parent, storage_opts)
    }

    /// Whether `id` is registered with the driver.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        LayerId::new(id).is_ok() && self.store.exists(id)
    }

    /// Ancestors of `id`, nearest first.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NotExist`] if `id` has no record.
    pub fn parent_chain(&self, id: &str) -> StrataResult<ParentChain> {
        let id = LayerId::new(id)?;
        self.store.parent_chain(id.as_str())
    }

    /// Resolve the content path of `id`, mounting its union if needed.
    ///
    /// Layers without ancestors are served straight from their diff
    /// directory. Calls are not reference counted: any number of `get`s is
    /// undone by a single [`Driver::put`].
    pub fn get(&self, id: &str, mount_label: &str) -> StrataResult<PathBuf> {
        let id = LayerId::new(id)?;
        let ancestors = match self.store.ancestor_paths(id.as_str()) {
            Ok(ancestors) => ancestors,
            Err(e) if e.is_not_exist() => Vec::new(),
            Err(e) => return Err(e),
        };

        let path = self.cache.get(id.as_str()).unwrap_or_else(|| {
            if ancestors.is_empty() {
                self.paths().diff_dir(id.as_str())
            } else {
                self.paths().mount_point(id.as_str())
            }
        });

        if !ancestors.is_empty() {
            self.mounts.mount(&id, &path, mount_label, &ancestors)?;
        }

        self.cache.insert(id.as_str(), path.clone());
        Ok(path)
    }

    /// Release `id`, unmounting its union.
    ///
    /// Unmount failures are logged and not returned. The mount point is
    /// cached even for an id that was never created; only
    /// [`Driver::remove`] forgets it.
    pub fn put(&self, id: &str) -> StrataResult<()> {
        let id = LayerId::new(id)?;
        let path = self
            .cache
            .get_or_insert(id.as_str(), || self.paths().mount_point(id.as_str()));

        if let Err(e) = self.mounts.unmount(&path) {
            tracing::debug!(layer_id = %id, path = %path.display(), error = %e, "Failed to unmount aufs");
        }
        Ok(())
    }

    /// Path currently cached for `id`.
    #[must_use]
    pub fn cached_path(&self, id: &str) -> Option<PathBuf> {
        self.cache.get(id)
    }

    /// Whether an aufs union is mounted on `path`.
    pub fn is_mounted(&self, path: &Path) -> StrataResult<bool> {
        self.mounts.is_mounted(path)
    }

    /// Human readable driver status.
    #[must_use]
    pub fn status(&self) -> Vec<(String, String)> {
        let dirs = self.store.list().map(|ids| ids.len()).unwrap_or_default();

        vec![
            ("Root Dir".to_string(), self.paths().root.display().to_string()),
            ("Backing Filesystem".to_string(), self.backing_fs.to_string()),
            ("Dirs".to_string(), dirs.to_string()),
            (
                "Dirperm1 Supported".to_string(),
                self.mounts.dirperm1().to_string(),
            ),
        ]
    }

    /// Extra metadata for `id`; aufs keeps none.
    pub fn metadata(&self, id: &str) -> StrataResult<HashMap<String, String>> {
        LayerId::new(id)?;
        Ok(HashMap::new())
    }

    /// Unmount every layer and release the root mount.
    pub fn cleanup(&self) -> StrataResult<()> {
        for entry in fs::read_dir(self.paths().mnt())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let path = entry.path();
            if let Err(e) = self.mounts.unmount(&path) {
                let name = entry.file_name();
                tracing::debug!(
                    layer_id = truncate_id(&name.to_string_lossy()),
                    error = %e,
                    "Error unmounting layer"
                );
            }
        }

        let root = &self.paths().root;
        if self.mounter.is_mount_point(root)? {
            self.mounter.unmount(root)?;
        }
        Ok(())
    }

    /// Write an uncompressed tar of the content of `id`.
    ///
    /// Only the layer's own diff directory is archived; aufs branches do
    /// not need the parent to produce a diff. Owners are written as
    /// container IDs.
    pub fn diff<W: Write>(&self, id: &str, writer: W) -> StrataResult<W> {
        let diff_dir = self.existing_diff_dir(id)?;
        archive::write_archive(&diff_dir, writer, &self.id_mappings)
    }

    /// Extract an uncompressed tar into `id`, returning the new layer size.
    ///
    /// Container owners in the archive are stored as their host IDs.
    pub fn apply_diff<R: Read>(&self, id: &str, reader: R) -> StrataResult<u64> {
        let diff_dir = self.existing_diff_dir(id)?;
        archive::apply_archive(reader, &diff_dir, &self.id_mappings)?;

        let size = archive::directory_size(&diff_dir)?;
        tracing::debug!(layer_id = id, size, "Applied diff");
        Ok(size)
    }

    /// Changes of `id` relative to all of its ancestors.
    pub fn changes(&self, id: &str) -> StrataResult<Vec<Change>> {
        let id = LayerId::new(id)?;
        let ancestors = self.store.ancestor_paths(id.as_str())?;
        archive::changes(&ancestors, &self.paths().diff_dir(id.as_str()))
    }

    /// Bytes used by the content of `id`.
    pub fn diff_size(&self, id: &str) -> StrataResult<u64> {
        let diff_dir = self.existing_diff_dir(id)?;
        archive::directory_size(&diff_dir)
    }

    fn existing_diff_dir(&self, id: &str) -> StrataResult<PathBuf> {
        let id = LayerId::new(id)?;
        let diff_dir = self.paths().diff_dir(id.as_str());
        if !diff_dir.is_dir() {
            return Err(StrataError::NotExist { id: id.to_string() });
        }
        Ok(diff_dir)
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(DRIVER_NAME)
    }
}

/// Turn `root` into a private mount, bind-mounting it onto itself first if
/// it is not a mount point yet.
fn make_private(mounter: &dyn Mounter, root: &Path) -> StrataResult<()> {
    if !mounter.is_mount_point(root)? {
        mounter.mount(root, root, "none", MountMode::Bind, "")?;
    }
    mounter.mount(Path::new("none"), root, "", MountMode::Private, "")
}
