//! Optional aufs feature detection.

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};

use super::mounts::{MountMode, Mounter};
use super::union::{AUFS, DIRPERM1, XINO_PATH};

/// Process-wide `dirperm1` probe shared by every driver instance.
pub static DIRPERM1_PROBE: Lazy<Arc<FeatureProbe>> = Lazy::new(|| Arc::new(FeatureProbe::new()));

/// Memoized result of a trial mount.
///
/// The first call runs the trial; every later call returns its result.
#[derive(Debug, Default)]
pub struct FeatureProbe {
    supported: OnceCell<bool>,
}

impl FeatureProbe {
    /// Create a probe that has not run yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            supported: OnceCell::new(),
        }
    }

    /// Create a probe whose answer is already known.
    #[must_use]
    pub const fn preset(supported: bool) -> Self {
        Self {
            supported: OnceCell::with_value(supported),
        }
    }

    /// Whether the host aufs accepts `dirperm1`, probing on first use.
    pub fn dirperm1(&self, mounter: &dyn Mounter) -> bool {
        *self.supported.get_or_init(|| probe_dirperm1(mounter))
    }

    /// The memoized result, if the probe already ran.
    #[must_use]
    pub fn cached(&self) -> Option<bool> {
        self.supported.get().copied()
    }
}

fn probe_dirperm1(mounter: &dyn Mounter) -> bool {
    let tempdir = |prefix: &str| tempfile::Builder::new().prefix(prefix).tempdir();

    let base = match tempdir("strata-aufs-base") {
        Ok(dir) => dir,
        Err(e) => {
            tracing::error!(error = %e, "Error checking dirperm1");
            return false;
        }
    };
    let union = match tempdir("strata-aufs-union") {
        Ok(dir) => dir,
        Err(e) => {
            tracing::error!(error = %e, "Error checking dirperm1");
            return false;
        }
    };

    let opts = format!("br:{},{DIRPERM1},xino={XINO_PATH}", base.path().display());
    let supported = match mounter.mount(Path::new("none"), union.path(), AUFS, MountMode::Fresh, &opts) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "dirperm1 trial mount failed");
            false
        }
    };

    if let Err(e) = mounter.unmount(union.path()) {
        if supported {
            tracing::error!(error = %e, "Error checking dirperm1: failed to unmount");
        } else {
            tracing::debug!(error = %e, "dirperm1 trial unmount failed");
        }
    }

    tracing::debug!(supported, "dirperm1 probe finished");
    supported
}
