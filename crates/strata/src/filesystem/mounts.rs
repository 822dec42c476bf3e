//! Mount operations.
//!
//! Every kernel interaction the driver performs goes through [`Mounter`], so
//! the composition and state-tracking logic can run against a recording
//! implementation in tests.

use std::fmt;
use std::path::Path;

use strata_common::{StrataError, StrataResult};

use super::magic::FsMagic;

/// Kind of mount call to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// Fresh mount of a new filesystem instance.
    Fresh,
    /// Update the options of an already mounted target.
    Remount,
    /// Bind `source` onto `target`.
    Bind,
    /// Make `target` a private mount (no propagation).
    Private,
}

/// Host mount table access.
pub trait Mounter: Send + Sync + fmt::Debug {
    /// Issue a mount call.
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: &str,
        mode: MountMode,
        data: &str,
    ) -> StrataResult<()>;

    /// Unmount `target`.
    fn unmount(&self, target: &Path) -> StrataResult<()>;

    /// Filesystem type identifier of the filesystem holding `path`.
    fn fs_magic(&self, path: &Path) -> StrataResult<FsMagic>;

    /// Whether `path` appears as a mount point in the mount table.
    fn is_mount_point(&self, path: &Path) -> StrataResult<bool>;

    /// Whether the kernel knows the filesystem type `fstype`.
    fn filesystem_supported(&self, fstype: &str) -> StrataResult<bool>;
}

/// [`Mounter`] backed by the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMounter;

/// Wrap an OS error from a mount-table call.
pub(crate) fn mount_failure(target: &Path, source: std::io::Error) -> StrataError {
    StrataError::MountFailure {
        target: target.to_path_buf(),
        source,
    }
}

#[cfg(target_os = "linux")]
impl Mounter for HostMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: &str,
        mode: MountMode,
        data: &str,
    ) -> StrataResult<()> {
        use rustix::mount::{MountFlags, MountPropagationFlags, mount, mount_bind, mount_change, mount_remount};
        use std::ffi::CString;

        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            fstype,
            ?mode,
            "Mounting filesystem"
        );

        let result = match mode {
            MountMode::Fresh => {
                let data_c = CString::new(data).map_err(|_| StrataError::Config {
                    message: "Invalid mount options (contains null byte)".to_string(),
                })?;
                mount(source, target, fstype, MountFlags::empty(), data_c.as_c_str())
            }
            MountMode::Remount => mount_remount(target, MountFlags::empty(), data),
            MountMode::Bind => mount_bind(source, target),
            MountMode::Private => mount_change(target, MountPropagationFlags::PRIVATE),
        };

        result.map_err(|e| mount_failure(target, e.into()))
    }

    fn unmount(&self, target: &Path) -> StrataResult<()> {
        use rustix::mount::{UnmountFlags, unmount};

        tracing::debug!(target = %target.display(), "Unmounting filesystem");

        // Flush pending pseudo-links before the branch set goes away.
        match std::process::Command::new("auplink")
            .arg(target)
            .arg("flush")
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!(target = %target.display(), %status, "auplink flush failed"),
            Err(e) => tracing::warn!(target = %target.display(), error = %e, "auplink flush failed"),
        }

        unmount(target, UnmountFlags::empty()).map_err(|e| mount_failure(target, e.into()))
    }

    fn fs_magic(&self, path: &Path) -> StrataResult<FsMagic> {
        let stat = rustix::fs::statfs(path).map_err(std::io::Error::from)?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(FsMagic(stat.f_type as u32))
    }

    fn is_mount_point(&self, path: &Path) -> StrataResult<bool> {
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
        let wanted = std::fs::canonicalize(path)?;
        Ok(mountinfo
            .lines()
            .filter_map(|line| line.split_whitespace().nth(4))
            .any(|mount_point| Path::new(&unescape_mountinfo(mount_point)) == wanted))
    }

    fn filesystem_supported(&self, fstype: &str) -> StrataResult<bool> {
        // Loading the module can fail inside nested containers; the
        // filesystem list below is authoritative either way.
        if let Err(e) = std::process::Command::new("modprobe").arg(fstype).output() {
            tracing::debug!(fstype, error = %e, "modprobe failed");
        }

        let filesystems = std::fs::read_to_string("/proc/filesystems")?;
        Ok(filesystems
            .lines()
            .filter_map(|line| line.split_whitespace().last())
            .any(|name| name == fstype))
    }
}

#[cfg(not(target_os = "linux"))]
impl Mounter for HostMounter {
    fn mount(&self, _: &Path, _: &Path, _: &str, _: MountMode, _: &str) -> StrataResult<()> {
        Err(StrataError::NotSupported)
    }

    fn unmount(&self, _target: &Path) -> StrataResult<()> {
        Err(StrataError::NotSupported)
    }

    fn fs_magic(&self, _path: &Path) -> StrataResult<FsMagic> {
        Err(StrataError::NotSupported)
    }

    fn is_mount_point(&self, _path: &Path) -> StrataResult<bool> {
        Err(StrataError::NotSupported)
    }

    fn filesystem_supported(&self, _fstype: &str) -> StrataResult<bool> {
        Ok(false)
    }
}

/// Decode the octal escapes (`\040` for space and friends) used in mountinfo.
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
