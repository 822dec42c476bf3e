//! Two-phase layer removal.
//!
//! Deleting a layer tree can take a long time and the filesystem offers no
//! atomic subtree delete. Removal therefore first renames each directory to
//! a `-removing` sibling and drops the record, at which point the layer is
//! gone for every lookup, and only then deletes the renamed trees.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use strata_common::{LayerId, LayerPaths, StrataError, StrataResult};

use super::Driver;

/// Directories of a removed layer awaiting deletion.
///
/// Whatever is still pending when the value is dropped gets deleted, so a
/// removal that fails halfway still cleans up what it already moved aside.
#[derive(Debug, Default)]
#[must_use = "dropping a Retired deletes its directories immediately"]
pub struct Retired {
    pending: Vec<PathBuf>,
}

impl Retired {
    /// Renamed directories not yet deleted.
    #[must_use]
    pub fn pending(&self) -> &[PathBuf] {
        &self.pending
    }

    /// Move `from` to `to` and schedule `to` for deletion.
    ///
    /// A missing `from` means an earlier attempt already moved it.
    fn hide(&mut self, from: &Path, to: &Path) -> StrataResult<()> {
        // Leftover of a process that died before its purge finished.
        if fs::symlink_metadata(to).is_ok() {
            if let Err(e) = fs::remove_dir_all(to) {
                tracing::warn!(path = %to.display(), error = %e, "Failed to clear stale removal");
            }
        }

        match fs::rename(from, to) {
            Ok(()) => {
                self.pending.push(to.to_path_buf());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StrataError::RenameFailure {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                source,
            }),
        }
    }

    /// Delete every pending directory.
    ///
    /// Failures are logged; the layer is already gone either way.
    pub fn purge(mut self) {
        self.purge_pending();
    }

    fn purge_pending(&mut self) {
        for path in self.pending.drain(..) {
            match fs::remove_dir_all(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed layer directory"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove layer directory"),
            }
        }
    }
}

impl Drop for Retired {
    fn drop(&mut self) {
        self.purge_pending();
    }
}

impl Driver {
    /// Make `id` disappear without deleting its contents yet.
    ///
    /// Unmounts the layer, renames its mount point and diff directory out
    /// of the way, deletes its record and forgets its cached path. Safe to
    /// call again after a partial failure.
    pub fn retire(&self, id: &str) -> StrataResult<Retired> {
        let id = LayerId::new(id)?;
        let paths = self.paths();
        let mount_point = paths.mount_point(id.as_str());

        let mounted = self
            .cache
            .get(id.as_str())
            .unwrap_or_else(|| mount_point.clone());
        if let Err(e) = self.mounts.unmount(&mounted) {
            // A mount that is still live makes the rename below fail loudly.
            tracing::debug!(layer_id = %id, path = %mounted.display(), error = %e, "Error while unmounting");
        }

        let mut retired = Retired::default();
        retired.hide(&mount_point, &LayerPaths::removing(&paths.mnt(), id.as_str()))?;
        retired.hide(
            &paths.diff_dir(id.as_str()),
            &LayerPaths::removing(&paths.diff(), id.as_str()),
        )?;

        self.store.remove_record(id.as_str())?;
        self.cache.remove(id.as_str());

        tracing::debug!(layer_id = %id, "Layer retired");
        Ok(retired)
    }

    /// Remove `id` and delete its contents.
    ///
    /// The renamed trees are deleted on the caller's thread before this
    /// returns. Use [`Driver::retire`] to defer that work.
    pub fn remove(&self, id: &str) -> StrataResult<()> {
        self.retire(id)?.purge();
        Ok(())
    }
}
