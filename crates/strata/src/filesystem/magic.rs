//! Filesystem type identifiers.

use std::fmt;

/// Filesystem magic number as reported by `statfs(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsMagic(pub u32);

impl FsMagic {
    /// aufs.
    pub const AUFS: Self = Self(0x6175_6673);
    /// btrfs.
    pub const BTRFS: Self = Self(0x9123_683E);
    /// ecryptfs.
    pub const ECRYPTFS: Self = Self(0xF15F);
    /// ext2/3/4.
    pub const EXTFS: Self = Self(0x0000_EF53);
    /// f2fs.
    pub const F2FS: Self = Self(0xF2F5_2010);
    /// jfs.
    pub const JFS: Self = Self(0x3153_464A);
    /// nfs.
    pub const NFS: Self = Self(0x0000_6969);
    /// overlayfs.
    pub const OVERLAY: Self = Self(0x794C_7630);
    /// ramfs.
    pub const RAMFS: Self = Self(0x8584_58F6);
    /// reiserfs.
    pub const REISERFS: Self = Self(0x5265_4973);
    /// smbfs.
    pub const SMBFS: Self = Self(0x0000_517B);
    /// squashfs.
    pub const SQUASHFS: Self = Self(0x7371_7368);
    /// tmpfs.
    pub const TMPFS: Self = Self(0x0102_1994);
    /// vxfs.
    pub const VXFS: Self = Self(0xA501_FCF5);
    /// xfs.
    pub const XFS: Self = Self(0x5846_5342);
    /// zfs.
    pub const ZFS: Self = Self(0x2FC1_2FC1);

    /// Backing filesystems that cannot host aufs branches.
    pub const INCOMPATIBLE: [Self; 2] = [Self::BTRFS, Self::AUFS];

    /// Human readable name, if the magic is known.
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::AUFS => "aufs",
            Self::BTRFS => "btrfs",
            Self::ECRYPTFS => "ecryptfs",
            Self::EXTFS => "extfs",
            Self::F2FS => "f2fs",
            Self::JFS => "jfs",
            Self::NFS => "nfs",
            Self::OVERLAY => "overlayfs",
            Self::RAMFS => "ramfs",
            Self::REISERFS => "reiserfs",
            Self::SMBFS => "smb",
            Self::SQUASHFS => "squashfs",
            Self::TMPFS => "tmpfs",
            Self::VXFS => "vxfs",
            Self::XFS => "xfs",
            Self::ZFS => "zfs",
            _ => return None,
        };
        Some(name)
    }

    /// Whether the driver refuses to run on top of this filesystem.
    #[must_use]
    pub fn is_incompatible(self) -> bool {
        Self::INCOMPATIBLE.contains(&self)
    }
}

impl fmt::Display for FsMagic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "<unknown 0x{:x}>", self.0),
        }
    }
}
