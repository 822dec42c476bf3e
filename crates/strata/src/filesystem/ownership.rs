//! UID/GID mapping and ownership-aware directory creation.

use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use strata_common::{StrataError, StrataResult};

/// UID/GID mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    /// Container ID (start).
    pub container_id: u32,
    /// Host ID (start).
    pub host_id: u32,
    /// Range size.
    pub size: u32,
}

impl IdMap {
    /// Create a new ID mapping.
    #[must_use]
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// Host ID for `id` if this range covers it.
    #[must_use]
    pub fn to_host(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.container_id)?;
        (offset < self.size).then(|| self.host_id.checked_add(offset)).flatten()
    }

    /// Container ID for host `id` if this range covers it.
    #[must_use]
    pub fn to_container(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.host_id)?;
        (offset < self.size).then(|| self.container_id.checked_add(offset)).flatten()
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.container_id, self.host_id, self.size)
    }
}

impl FromStr for IdMap {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StrataError::IdMapping {
            message: format!("invalid mapping {s:?}, expected container:host:size"),
        };

        let parts: Vec<&str> = s.split(':').collect();
        let [container, host, size] = parts.as_slice() else {
            return Err(invalid());
        };

        Ok(Self::new(
            container.parse().map_err(|_| invalid())?,
            host.parse().map_err(|_| invalid())?,
            size.parse().map_err(|_| invalid())?,
        ))
    }
}

/// UID and GID maps applied to layer content crossing the container boundary.
///
/// An empty map for one kind of ID means that kind is not translated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMappings {
    uids: Vec<IdMap>,
    gids: Vec<IdMap>,
}

impl IdMappings {
    /// Create mappings from UID and GID ranges.
    #[must_use]
    pub fn new(uids: Vec<IdMap>, gids: Vec<IdMap>) -> Self {
        Self { uids, gids }
    }

    /// Whether no ID is translated at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uids.is_empty() && self.gids.is_empty()
    }

    /// Host owner of a container `(uid, gid)` pair.
    pub fn to_host(&self, uid: u32, gid: u32) -> StrataResult<(u32, u32)> {
        Ok((
            translate(&self.uids, uid, "uid", IdMap::to_host)?,
            translate(&self.gids, gid, "gid", IdMap::to_host)?,
        ))
    }

    /// Container owner of a host `(uid, gid)` pair.
    pub fn to_container(&self, uid: u32, gid: u32) -> StrataResult<(u32, u32)> {
        Ok((
            translate(&self.uids, uid, "uid", IdMap::to_container)?,
            translate(&self.gids, gid, "gid", IdMap::to_container)?,
        ))
    }
}

fn translate(
    maps: &[IdMap],
    id: u32,
    kind: &str,
    direction: fn(&IdMap, u32) -> Option<u32>,
) -> StrataResult<u32> {
    if maps.is_empty() {
        return Ok(id);
    }
    maps.iter()
        .find_map(|m| direction(m, id))
        .ok_or_else(|| StrataError::IdMapping {
            message: format!("{kind} {id} is outside of the configured mappings"),
        })
}

/// Host owner of everything the driver creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootIds {
    /// Host UID of container root.
    pub uid: u32,
    /// Host GID of container root.
    pub gid: u32,
}

impl RootIds {
    /// Effective IDs of the current process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            uid: rustix::process::geteuid().as_raw(),
            gid: rustix::process::getegid().as_raw(),
        }
    }
}

/// Resolve the host IDs that container root maps to.
///
/// Without any maps the driver's own effective IDs are used.
pub fn root_ids(uid_maps: &[IdMap], gid_maps: &[IdMap]) -> StrataResult<RootIds> {
    if uid_maps.is_empty() && gid_maps.is_empty() {
        return Ok(RootIds::current());
    }

    let current = RootIds::current();
    let uid = map_root(uid_maps, "uid")?.unwrap_or(current.uid);
    let gid = map_root(gid_maps, "gid")?.unwrap_or(current.gid);
    Ok(RootIds { uid, gid })
}

fn map_root(maps: &[IdMap], kind: &str) -> StrataResult<Option<u32>> {
    if maps.is_empty() {
        return Ok(None);
    }
    maps.iter()
        .find_map(|m| m.to_host(0))
        .map(Some)
        .ok_or_else(|| StrataError::IdMapping {
            message: format!("container root {kind} is not mapped"),
        })
}

/// Create `path` and any missing parents, owned by `owner` with `mode`.
///
/// Components that already exist are left untouched.
pub fn make_dir_all_as(path: &Path, mode: u32, owner: RootIds) -> StrataResult<()> {
    let missing: Vec<PathBuf> = path
        .ancestors()
        .take_while(|p| !p.as_os_str().is_empty() && fs::symlink_metadata(p).is_err())
        .map(Path::to_path_buf)
        .collect();

    fs::create_dir_all(path)?;

    // Parents first, so a failure leaves the shallowest directories fixed up.
    for dir in missing.iter().rev() {
        fs::set_permissions(dir, fs::Permissions::from_mode(mode))?;
        std::os::unix::fs::chown(dir, Some(owner.uid), Some(owner.gid))?;
    }

    if !missing.is_empty() {
        tracing::debug!(path = %path.display(), mode = format!("{mode:o}"), "Created directory");
    }
    Ok(())
}
