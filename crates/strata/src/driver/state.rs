//! Mount state transitions.
//!
//! Every mount, unmount and mounted-check runs under one driver-wide lock.
//! Remounts that append branches to one target must not interleave with the
//! composition of another target sharing the same read-only branches, so
//! the lock is deliberately not per layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_common::{LayerId, LayerPaths, StrataResult};

use crate::filesystem::{FeatureProbe, FsMagic, Mounter, UnionMount};

/// Idempotent mount/unmount of layer mount points.
#[derive(Debug)]
pub struct MountState {
    /// Host mount table.
    mounter: Arc<dyn Mounter>,
    /// Root layout, for resolving writable branches.
    paths: LayerPaths,
    /// `dirperm1` support, probed on first composition.
    probe: Arc<FeatureProbe>,
    /// Serializes every transition.
    lock: Mutex<()>,
}

impl MountState {
    /// Create a tracker over `mounter`.
    pub fn new(mounter: Arc<dyn Mounter>, paths: LayerPaths, probe: Arc<FeatureProbe>) -> Self {
        Self {
            mounter,
            paths,
            probe,
            lock: Mutex::new(()),
        }
    }

    /// Mount the union of `id` over `ro_layers` on `target`.
    ///
    /// Does nothing if `target` is already mounted.
    pub fn mount(
        &self,
        id: &LayerId,
        target: &Path,
        mount_label: &str,
        ro_layers: &[PathBuf],
    ) -> StrataResult<()> {
        let _guard = self.lock.lock();

        if self.mounted(target)? {
            tracing::debug!(layer_id = %id, target = %target.display(), "Already mounted");
            return Ok(());
        }

        let rw = self.paths.diff_dir(id.as_str());
        let dirperm1 = self.probe.dirperm1(self.mounter.as_ref());

        UnionMount::new(&rw, ro_layers, mount_label)
            .with_dirperm1(dirperm1)
            .mount(self.mounter.as_ref(), target)?;

        tracing::debug!(layer_id = %id, target = %target.display(), layers = ro_layers.len(), "Layer mounted");
        Ok(())
    }

    /// Unmount `path`; does nothing if it is not mounted.
    pub fn unmount(&self, path: &Path) -> StrataResult<()> {
        let _guard = self.lock.lock();

        if !self.mounted(path)? {
            return Ok(());
        }

        self.mounter.unmount(path)?;
        tracing::debug!(target = %path.display(), "Layer unmounted");
        Ok(())
    }

    /// Whether aufs accepts `dirperm1`.
    ///
    /// The first call runs a trial mount, so it takes the lock too.
    pub fn dirperm1(&self) -> bool {
        let _guard = self.lock.lock();
        self.probe.dirperm1(self.mounter.as_ref())
    }

    /// Whether an aufs instance is mounted on `path`.
    pub fn is_mounted(&self, path: &Path) -> StrataResult<bool> {
        let _guard = self.lock.lock();
        self.mounted(path)
    }

    fn mounted(&self, path: &Path) -> StrataResult<bool> {
        Ok(self.mounter.fs_magic(path)? == FsMagic::AUFS)
    }
}
