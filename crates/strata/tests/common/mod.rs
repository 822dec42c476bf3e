//! Shared fixtures for driver integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use strata::driver::{Driver, DriverConfig};
use strata::filesystem::{FeatureProbe, FsMagic, MountMode, Mounter};
use strata_common::{StrataError, StrataResult};
use tempfile::TempDir;

/// One recorded call into the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Mount {
        target: PathBuf,
        mode: MountMode,
        data: String,
    },
    Unmount {
        target: PathBuf,
    },
}

#[derive(Debug)]
pub struct FakeState {
    pub calls: Vec<Call>,
    pub mounted: HashSet<PathBuf>,
    pub mount_points: HashSet<PathBuf>,
    /// Fail the n-th aufs mount/remount call (zero based).
    pub fail_mount_at: Option<usize>,
    pub fail_unmount: bool,
    pub supported: bool,
    pub backing: FsMagic,
    aufs_calls: usize,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            mounted: HashSet::new(),
            mount_points: HashSet::new(),
            fail_mount_at: None,
            fail_unmount: false,
            supported: true,
            backing: FsMagic::EXTFS,
            aufs_calls: 0,
        }
    }
}

/// In-memory mount table that records every call.
#[derive(Debug, Default)]
pub struct FakeMounter {
    pub state: Mutex<FakeState>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

fn os_error(target: &Path, code: i32) -> StrataError {
    StrataError::MountFailure {
        target: target.to_path_buf(),
        source: std::io::Error::from_raw_os_error(code),
    }
}

impl FakeMounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hold the call open briefly so overlapping callers would be observed.
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(1));
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// aufs mount and remount calls, in issue order.
    pub fn aufs_calls(&self) -> Vec<(MountMode, PathBuf, String)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Mount { target, mode, data } if matches!(mode, MountMode::Fresh | MountMode::Remount) => {
                    Some((*mode, target.clone(), data.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Targets of unmount calls, in issue order.
    pub fn unmounts(&self) -> Vec<PathBuf> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Unmount { target } => Some(target.clone()),
                Call::Mount { .. } => None,
            })
            .collect()
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.state.lock().mounted.contains(path)
    }
}

impl Mounter for FakeMounter {
    fn mount(
        &self,
        _source: &Path,
        target: &Path,
        _fstype: &str,
        mode: MountMode,
        data: &str,
    ) -> StrataResult<()> {
        self.enter();
        let result = {
            let mut state = self.state.lock();
            state.calls.push(Call::Mount {
                target: target.to_path_buf(),
                mode,
                data: data.to_string(),
            });

            match mode {
                MountMode::Fresh | MountMode::Remount => {
                    let index = state.aufs_calls;
                    state.aufs_calls += 1;
                    if state.fail_mount_at == Some(index) {
                        Err(os_error(target, libc::EINVAL))
                    } else if mode == MountMode::Remount && !state.mounted.contains(target) {
                        Err(os_error(target, libc::EINVAL))
                    } else {
                        state.mounted.insert(target.to_path_buf());
                        Ok(())
                    }
                }
                MountMode::Bind => {
                    state.mount_points.insert(target.to_path_buf());
                    Ok(())
                }
                MountMode::Private => Ok(()),
            }
        };
        self.leave();
        result
    }

    fn unmount(&self, target: &Path) -> StrataResult<()> {
        self.enter();
        let result = {
            let mut state = self.state.lock();
            state.calls.push(Call::Unmount {
                target: target.to_path_buf(),
            });

            if state.fail_unmount {
                Err(os_error(target, libc::EBUSY))
            } else if state.mounted.remove(target) || state.mount_points.remove(target) {
                Ok(())
            } else {
                Err(os_error(target, libc::EINVAL))
            }
        };
        self.leave();
        result
    }

    fn fs_magic(&self, path: &Path) -> StrataResult<FsMagic> {
        let state = self.state.lock();
        if state.mounted.contains(path) {
            return Ok(FsMagic::AUFS);
        }
        std::fs::symlink_metadata(path)?;
        Ok(state.backing)
    }

    fn is_mount_point(&self, path: &Path) -> StrataResult<bool> {
        Ok(self.state.lock().mount_points.contains(path))
    }

    fn filesystem_supported(&self, fstype: &str) -> StrataResult<bool> {
        Ok(fstype == "aufs" && self.state.lock().supported)
    }
}

/// A driver rooted in a fresh temporary directory.
pub struct Harness {
    pub temp: TempDir,
    pub mounter: Arc<FakeMounter>,
    pub driver: Driver,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_probe(FeatureProbe::preset(false))
    }

    pub fn with_probe(probe: FeatureProbe) -> Self {
        Self::with_config(probe, |config| config)
    }

    pub fn with_config(probe: FeatureProbe, configure: impl FnOnce(DriverConfig) -> DriverConfig) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let mounter = FakeMounter::new();
        let config = configure(DriverConfig::default().with_root(temp.path().join("aufs")));
        let driver = Driver::init_with(config, mounter.clone(), Arc::new(probe)).unwrap();
        Self {
            temp,
            mounter,
            driver,
        }
    }

    pub fn diff(&self, id: &str) -> PathBuf {
        self.driver.paths().diff_dir(id)
    }

    pub fn mnt(&self, id: &str) -> PathBuf {
        self.driver.paths().mount_point(id)
    }

    /// Create `ids` as a chain, each on top of the previous one.
    pub fn chain(&self, ids: &[&str]) {
        let none = std::collections::HashMap::new();
        let mut parent = "";
        for id in ids {
            self.driver.create(id, parent, &none).unwrap();
            parent = id;
        }
    }
}

/// Branch paths of a set of aufs calls, in stacking order.
///
/// The first entry is the writable branch.
pub fn branches(calls: &[(MountMode, PathBuf, String)]) -> Vec<String> {
    let mut out = Vec::new();
    for (mode, _, data) in calls {
        let options = data.split(",context=").next().unwrap_or_default();
        match mode {
            MountMode::Fresh => {
                let list = options.strip_prefix("br:").unwrap();
                let list = list.split(',').next().unwrap();
                out.extend(list.split(':').map(str::to_string));
            }
            MountMode::Remount => {
                let branch = options.strip_prefix("append:").unwrap();
                assert!(!branch.contains(':'), "one branch per remount: {branch}");
                out.push(branch.to_string());
            }
            _ => {}
        }
    }
    out
}
