//! aufs union mount composition.
//!
//! The kernel copies at most one page of mount option data per call, so a
//! long ancestor chain cannot be described in a single `mount(2)`. The
//! initial mount carries as many read-only branches as fit in the page; the
//! remaining branches are appended one remount at a time, nearest ancestor
//! first, which keeps the branch priority identical to the chain order.

use std::path::{Path, PathBuf};

use strata_common::StrataResult;

use super::label::format_mount_label;
use super::mounts::{MountMode, Mounter};

/// Filesystem type passed to `mount(2)`.
pub const AUFS: &str = "aufs";

/// External inode translation table shared by all aufs mounts.
pub const XINO_PATH: &str = "/dev/shm/aufs.xino";

/// Mount option enabling per-branch directory permission resolution.
pub const DIRPERM1: &str = "dirperm1";

/// Page room reserved for the xino option and label framing.
const BASE_OVERHEAD: usize = 54;

/// Host memory page size.
#[cfg(target_os = "linux")]
#[must_use]
pub fn page_size() -> usize {
    rustix::param::page_size()
}

/// Host memory page size.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn page_size() -> usize {
    4096
}

/// The sequence of mount calls that builds one union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    /// Option data for the initial (fresh) mount, label included.
    pub initial: String,
    /// Option data for each follow-up remount, in issue order.
    pub remounts: Vec<String>,
    /// Number of read-only branches packed into the initial mount.
    pub packed: usize,
}

impl MountPlan {
    /// Total number of mount calls the plan issues.
    #[must_use]
    pub fn calls(&self) -> usize {
        1 + self.remounts.len()
    }
}

/// A read-write branch stacked over read-only ancestor branches.
#[derive(Debug, Clone)]
pub struct UnionMount<'a> {
    /// Writable branch (the layer's own diff directory).
    rw: &'a Path,
    /// Read-only branches, nearest ancestor first.
    ro: &'a [PathBuf],
    /// SELinux mount label, possibly empty.
    label: &'a str,
    /// Whether `dirperm1` is appended to the options.
    dirperm1: bool,
    /// Size limit for a single call's option data.
    page_size: usize,
}

impl<'a> UnionMount<'a> {
    /// Describe a union of `rw` over `ro`.
    #[must_use]
    pub fn new(rw: &'a Path, ro: &'a [PathBuf], label: &'a str) -> Self {
        Self {
            rw,
            ro,
            label,
            dirperm1: false,
            page_size: page_size(),
        }
    }

    /// Enable or disable the `dirperm1` option.
    #[must_use]
    pub fn with_dirperm1(mut self, enabled: bool) -> Self {
        self.dirperm1 = enabled;
        self
    }

    /// Override the per-call option size limit.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Bytes reserved besides the branch list.
    #[must_use]
    pub fn overhead(&self) -> usize {
        if self.dirperm1 {
            BASE_OVERHEAD + DIRPERM1.len()
        } else {
            BASE_OVERHEAD
        }
    }

    /// Bytes available to the branch list of the initial mount.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.page_size
            .saturating_sub(self.label.len())
            .saturating_sub(self.overhead())
    }

    /// Options appended after the branch list of the initial mount.
    #[must_use]
    pub fn suffix(&self) -> String {
        let mut opts = format!("dio,xino={XINO_PATH}");
        if self.dirperm1 {
            opts.push(',');
            opts.push_str(DIRPERM1);
        }
        opts
    }

    /// Split the branches into the initial mount and the remounts.
    ///
    /// The writable branch always goes into the initial mount, even if it
    /// alone exceeds the capacity; ancestors are packed greedily until the
    /// first one that does not fit.
    #[must_use]
    pub fn plan(&self) -> MountPlan {
        let capacity = self.capacity();
        let mut branches = format!("br:{}=rw", self.rw.display());

        let mut packed = 0;
        for layer in self.ro {
            let branch = ro_branch(layer);
            if branches.len() + branch.len() > capacity {
                break;
            }
            branches.push_str(&branch);
            packed += 1;
        }

        let initial = format_mount_label(&format!("{branches},{}", self.suffix()), self.label);
        let remounts = self.ro[packed..]
            .iter()
            .map(|layer| format_mount_label(&format!("append{}", ro_branch(layer)), self.label))
            .collect();

        MountPlan {
            initial,
            remounts,
            packed,
        }
    }

    /// Mount the union on `target`.
    ///
    /// On any failure the target is unmounted before the original error is
    /// returned; a failing unwind is only logged.
    pub fn mount(&self, mounter: &dyn Mounter, target: &Path) -> StrataResult<()> {
        let plan = self.plan();

        tracing::debug!(
            target = %target.display(),
            packed = plan.packed,
            remounts = plan.remounts.len(),
            "Mounting aufs"
        );

        let result = Self::issue(mounter, target, &plan);
        if let Err(err) = &result {
            tracing::debug!(target = %target.display(), error = %err, "aufs mount failed, unwinding");
            if let Err(unwind) = mounter.unmount(target) {
                tracing::debug!(target = %target.display(), error = %unwind, "Unwind unmount failed");
            }
        }
        result
    }

    fn issue(mounter: &dyn Mounter, target: &Path, plan: &MountPlan) -> StrataResult<()> {
        let none = Path::new("none");
        mounter.mount(none, target, AUFS, MountMode::Fresh, &plan.initial)?;
        for data in &plan.remounts {
            mounter.mount(none, target, AUFS, MountMode::Remount, data)?;
        }
        Ok(())
    }
}

/// Option fragment adding one read-only, whiteout-aware branch.
fn ro_branch(layer: &Path) -> String {
    format!(":{}=ro+wh", layer.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::magic::FsMagic;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use strata_common::StrataError;

    #[derive(Debug, Default)]
    struct Recorder {
        calls: Mutex<Vec<(MountMode, String)>>,
        unmounts: Mutex<Vec<PathBuf>>,
        fail_at: Option<usize>,
    }

    impl Mounter for Recorder {
        fn mount(&self, _: &Path, target: &Path, _: &str, mode: MountMode, data: &str) -> StrataResult<()> {
            let mut calls = self.calls.lock();
            if self.fail_at == Some(calls.len()) {
                return Err(crate::filesystem::mounts::mount_failure(
                    target,
                    std::io::Error::from_raw_os_error(libc::EINVAL),
                ));
            }
            calls.push((mode, data.to_string()));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> StrataResult<()> {
            self.unmounts.lock().push(target.to_path_buf());
            Err(StrataError::Internal {
                message: "unwind failure".to_string(),
            })
        }

        fn fs_magic(&self, _: &Path) -> StrataResult<FsMagic> {
            Ok(FsMagic::EXTFS)
        }

        fn is_mount_point(&self, _: &Path) -> StrataResult<bool> {
            Ok(false)
        }

        fn filesystem_supported(&self, _: &str) -> StrataResult<bool> {
            Ok(true)
        }
    }

    fn layers(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from(format!("/d/{n}"))).collect()
    }

    #[test]
    fn single_call_when_everything_fits() {
        let ro = layers(&["b", "a"]);
        let plan = UnionMount::new(Path::new("/d/c"), &ro, "").plan();

        insta::assert_snapshot!(plan.initial, @"br:/d/c=rw:/d/b=ro+wh:/d/a=ro+wh,dio,xino=/dev/shm/aufs.xino");
        assert_eq!(plan.packed, 2);
        assert!(plan.remounts.is_empty());
        assert_eq!(plan.calls(), 1);
    }

    #[test]
    fn dirperm1_changes_suffix_and_overhead() {
        let ro = layers(&["a"]);
        let mount = UnionMount::new(Path::new("/d/b"), &ro, "").with_dirperm1(true);

        assert_eq!(mount.overhead(), 62);
        assert!(mount.plan().initial.ends_with(",dio,xino=/dev/shm/aufs.xino,dirperm1"));
    }

    #[test]
    fn label_wraps_every_call() {
        let ro = layers(&["b", "a"]);
        // Room for the rw branch and exactly one ancestor.
        let rw = Path::new("/d/c");
        let label = "s0:c1";
        let page = label.len() + BASE_OVERHEAD + "br:/d/c=rw".len() + ":/d/b=ro+wh".len();
        let plan = UnionMount::new(rw, &ro, label).with_page_size(page).plan();

        assert_eq!(plan.packed, 1);
        assert_eq!(
            plan.initial,
            "br:/d/c=rw:/d/b=ro+wh,dio,xino=/dev/shm/aufs.xino,context=\"s0:c1\""
        );
        assert_eq!(plan.remounts, vec!["append:/d/a=ro+wh,context=\"s0:c1\"".to_string()]);
    }

    #[test]
    fn oversized_label_leaves_only_rw_branch() {
        let ro = layers(&["c", "b", "a"]);
        let label = "x".repeat(4096);
        let plan = UnionMount::new(Path::new("/d/d"), &ro, &label)
            .with_page_size(4096)
            .plan();

        assert_eq!(plan.packed, 0);
        assert!(plan.initial.starts_with("br:/d/d=rw,dio,"));
        assert_eq!(plan.remounts.len(), 3);
        assert!(plan.remounts[0].starts_with("append:/d/c=ro+wh"));
        assert!(plan.remounts[1].starts_with("append:/d/b=ro+wh"));
        assert!(plan.remounts[2].starts_with("append:/d/a=ro+wh"));
    }

    #[test]
    fn mount_issues_fresh_then_remounts_in_order() {
        let ro = layers(&["c", "b", "a"]);
        let recorder = Recorder::default();
        let page = BASE_OVERHEAD + "br:/d/d=rw".len() + ":/d/c=ro+wh".len();

        UnionMount::new(Path::new("/d/d"), &ro, "")
            .with_page_size(page)
            .mount(&recorder, Path::new("/m/d"))
            .unwrap();

        let calls = recorder.calls.lock();
        let modes: Vec<_> = calls.iter().map(|(mode, _)| *mode).collect();
        assert_eq!(modes, vec![MountMode::Fresh, MountMode::Remount, MountMode::Remount]);
        assert_eq!(calls[1].1, "append:/d/b=ro+wh");
        assert_eq!(calls[2].1, "append:/d/a=ro+wh");
        assert!(recorder.unmounts.lock().is_empty());
    }

    #[test]
    fn failed_remount_unwinds_and_keeps_original_error() {
        let ro = layers(&["b", "a"]);
        let recorder = Recorder {
            fail_at: Some(1),
            ..Recorder::default()
        };

        let err = UnionMount::new(Path::new("/d/c"), &ro, "")
            .with_page_size(BASE_OVERHEAD + "br:/d/c=rw".len())
            .mount(&recorder, Path::new("/m/c"))
            .unwrap_err();

        assert!(matches!(err, StrataError::MountFailure { .. }));
        assert_eq!(recorder.unmounts.lock().as_slice(), &[PathBuf::from("/m/c")]);
    }

    proptest! {
        #[test]
        fn packs_maximal_prefix_and_remounts_the_rest(
            label_len in 0usize..400,
            names in proptest::collection::vec("[a-z0-9]{1,120}", 0..60),
            dirperm1 in any::<bool>(),
        ) {
            let label = "l".repeat(label_len);
            let ro: Vec<PathBuf> = names.iter().map(|n| PathBuf::from(format!("/var/lib/strata/aufs/diff/{n}"))).collect();
            let rw = Path::new("/var/lib/strata/aufs/diff/top");
            let mount = UnionMount::new(rw, &ro, &label).with_page_size(4096).with_dirperm1(dirperm1);
            let plan = mount.plan();

            let capacity = mount.capacity();
            let rw_len = format!("br:{}=rw", rw.display()).len();
            let prefix_len: usize = ro[..plan.packed].iter().map(|p| ro_branch(p).len()).sum();
            prop_assert!(plan.packed == 0 || rw_len + prefix_len <= capacity);
            if plan.packed < ro.len() {
                prop_assert!(rw_len + prefix_len + ro_branch(&ro[plan.packed]).len() > capacity);
            }

            prop_assert_eq!(plan.remounts.len(), ro.len() - plan.packed);
            for (data, layer) in plan.remounts.iter().zip(&ro[plan.packed..]) {
                let expected = format_mount_label(&format!("append{}", ro_branch(layer)), &label);
                prop_assert_eq!(data, &expected);
            }
        }
    }
}
