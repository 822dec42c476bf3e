//! Filesystem building blocks of the aufs driver.
//!
//! This module handles:
//! - Host mount table access
//! - Union mount composition
//! - Optional feature detection
//! - Layer records and directories
//! - Layer archives and change lists

pub mod archive;
pub mod capability;
pub mod label;
pub mod layers;
pub mod magic;
pub mod mounts;
pub mod ownership;
pub mod union;

pub use archive::{Change, ChangeKind};
pub use capability::{DIRPERM1_PROBE, FeatureProbe};
pub use label::format_mount_label;
pub use layers::{LayerStore, ParentChain};
pub use magic::FsMagic;
pub use mounts::{HostMounter, MountMode, Mounter};
pub use ownership::{IdMap, IdMappings, RootIds};
pub use union::{MountPlan, UnionMount};
