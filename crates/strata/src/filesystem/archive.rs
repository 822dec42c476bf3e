//! Layer content archives and change detection.
//!
//! Layer diffs are kept in aufs format: a deleted entry is represented by a
//! `.wh.<name>` whiteout file next to where the entry used to be, and aufs
//! keeps its own bookkeeping under `.wh..wh.*` names at the branch root.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use strata_common::{StrataError, StrataResult};
use walkdir::WalkDir;

use super::ownership::IdMappings;

/// Prefix of a whiteout entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Prefix of aufs internal metadata entries.
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

/// Marker making a directory opaque to lower branches.
pub const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";

/// Kind of change recorded for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Present in an ancestor and changed in this layer.
    Modify,
    /// Not present in any ancestor.
    Add,
    /// Whited out by this layer.
    Delete,
}

/// A single change between a layer and its ancestors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    /// Absolute path inside the layer.
    pub path: String,
    /// What happened to it.
    pub kind: ChangeKind,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.kind {
            ChangeKind::Modify => 'C',
            ChangeKind::Add => 'A',
            ChangeKind::Delete => 'D',
        };
        write!(f, "{marker} {}", self.path)
    }
}

fn relative<'a>(root: &Path, path: &'a Path) -> StrataResult<&'a Path> {
    path.strip_prefix(root).map_err(|e| StrataError::Internal {
        message: format!("walked outside of {}: {e}", root.display()),
    })
}

/// Whether a root-level entry is aufs bookkeeping that must not be exported.
fn is_branch_metadata(rel: &Path) -> bool {
    let mut components = rel.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => {
            let name = name.to_string_lossy();
            name.starts_with(WHITEOUT_META_PREFIX) && name != WHITEOUT_OPAQUE_DIR
        }
        _ => false,
    }
}

/// Write an uncompressed tar of `diff_dir` into `writer`.
///
/// Entry owners are translated from host to container IDs.
pub fn write_archive<W: Write>(diff_dir: &Path, writer: W, ids: &IdMappings) -> StrataResult<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    let mut entries = WalkDir::new(diff_dir).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = entries.next() {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = relative(diff_dir, entry.path())?;

        if is_branch_metadata(rel) {
            if entry.file_type().is_dir() {
                entries.skip_current_dir();
            }
            continue;
        }

        let meta = entry.metadata().map_err(std::io::Error::from)?;
        append_entry(&mut builder, entry.path(), rel, &meta, ids)?;
    }

    Ok(builder.into_inner()?)
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    rel: &Path,
    meta: &fs::Metadata,
    ids: &IdMappings,
) -> StrataResult<()> {
    let file_type = meta.file_type();
    if file_type.is_socket() {
        tracing::debug!(path = %path.display(), "Skipping socket");
        return Ok(());
    }

    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(meta, tar::HeaderMode::Complete);
    header.set_size(0);

    let (uid, gid) = ids.to_container(meta.uid(), meta.gid())?;
    header.set_uid(u64::from(uid));
    header.set_gid(u64::from(gid));

    if file_type.is_file() {
        header.set_size(meta.len());
        let content = fs::File::open(path)?.take(meta.len());
        builder.append_data(&mut header, rel, content)?;
    } else if file_type.is_symlink() {
        builder.append_link(&mut header, rel, fs::read_link(path)?)?;
    } else {
        if file_type.is_char_device() || file_type.is_block_device() {
            header.set_device_major(rustix::fs::major(meta.rdev()))?;
            header.set_device_minor(rustix::fs::minor(meta.rdev()))?;
        }
        builder.append_data(&mut header, rel, std::io::empty())?;
    }
    Ok(())
}

/// Extract an uncompressed tar from `reader` into `diff_dir`.
///
/// Entry owners are translated from container to host IDs.
pub fn apply_archive<R: Read>(reader: R, diff_dir: &Path, ids: &IdMappings) -> StrataResult<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    if ids.is_empty() {
        archive.unpack(diff_dir)?;
        return Ok(());
    }

    for entry in archive.entries()? {
        let mut entry = entry?;
        let header = entry.header();
        let (uid, gid) = ids.to_host(header_id(header.uid()?)?, header_id(header.gid()?)?)?;
        let mode = header.mode()?;
        let is_symlink = header.entry_type().is_symlink();
        let dest = destination(diff_dir, &entry.path()?);

        if !entry.unpack_in(diff_dir)? {
            continue;
        }

        std::os::unix::fs::lchown(&dest, Some(uid), Some(gid))?;
        // A change of owner drops set-id bits.
        if !is_symlink {
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

fn header_id(id: u64) -> StrataResult<u32> {
    u32::try_from(id).map_err(|_| StrataError::IdMapping {
        message: format!("archive owner {id} does not fit a 32-bit id"),
    })
}

/// Where an entry named `path` lands under `root`.
fn destination(root: &Path, path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .fold(root.to_path_buf(), |dest, part| dest.join(part))
}

/// Changes in `diff_dir` relative to `ancestors` (nearest first).
pub fn changes(ancestors: &[PathBuf], diff_dir: &Path) -> StrataResult<Vec<Change>> {
    let mut changes = Vec::new();

    let mut entries = WalkDir::new(diff_dir).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = entries.next() {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = relative(diff_dir, entry.path())?;
        let name = entry.file_name().to_string_lossy();
        let rooted = Path::new("/").join(rel);

        if name.starts_with(WHITEOUT_META_PREFIX) {
            if entry.file_type().is_dir() {
                entries.skip_current_dir();
            }
            continue;
        }

        if let Some(deleted) = name.strip_prefix(WHITEOUT_PREFIX) {
            changes.push(Change {
                path: rooted.with_file_name(deleted).to_string_lossy().into_owned(),
                kind: ChangeKind::Delete,
            });
            continue;
        }

        let meta = entry.metadata().map_err(std::io::Error::from)?;
        let lower = ancestors
            .iter()
            .find_map(|layer| fs::symlink_metadata(layer.join(rel)).ok());
        let kind = match lower {
            None => ChangeKind::Add,
            // Directories carried over untouched are not changes.
            Some(lower) if meta.is_dir() && lower.is_dir() && same_directory(&meta, &lower) => continue,
            Some(_) => ChangeKind::Modify,
        };

        changes.push(Change {
            path: rooted.to_string_lossy().into_owned(),
            kind,
        });
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

fn same_directory(upper: &fs::Metadata, lower: &fs::Metadata) -> bool {
    upper.permissions().mode() == lower.permissions().mode()
        && upper.len() == lower.len()
        && upper.mtime() == lower.mtime()
        && upper.mtime_nsec() == lower.mtime_nsec()
}

/// Bytes used by non-directory entries under `path`, hard links counted once.
pub fn directory_size(path: &Path) -> StrataResult<u64> {
    let mut seen = HashSet::new();
    let mut total = 0;

    for entry in WalkDir::new(path) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_dir() {
            continue;
        }

        let meta = entry.metadata().map_err(std::io::Error::from)?;
        if meta.nlink() > 1 && !seen.insert((meta.dev(), meta.ino())) {
            continue;
        }
        total += meta.len();
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::IdMap;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn archive_skips_branch_metadata() {
        let temp = tempfile::tempdir().unwrap();
        let diff = temp.path().join("diff");
        write(&diff.join("etc/hostname"), "box");
        write(&diff.join(".wh..wh.aufs"), "");
        write(&diff.join(".wh..wh.plnk/123"), "");
        write(&diff.join("etc/.wh.passwd"), "");
        fs::create_dir_all(diff.join(WHITEOUT_OPAQUE_DIR)).unwrap();

        let bytes = write_archive(&diff, Vec::new(), &IdMappings::default()).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().trim_end_matches('/').to_string())
            .collect();

        assert!(names.contains(&"etc/hostname".to_string()));
        assert!(names.contains(&"etc/.wh.passwd".to_string()));
        assert!(names.contains(&WHITEOUT_OPAQUE_DIR.to_string()));
        assert!(!names.iter().any(|n| n.starts_with(".wh..wh.aufs") || n.starts_with(".wh..wh.plnk")));
    }

    #[test]
    fn archive_applies_into_layer() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("source");
        let target = temp.path().join("target");
        write(&source.join("bin/tool"), "#!/bin/sh\n");
        fs::create_dir_all(&target).unwrap();

        let bytes = write_archive(&source, Vec::new(), &IdMappings::default()).unwrap();
        apply_archive(bytes.as_slice(), &target, &IdMappings::default()).unwrap();

        assert_eq!(fs::read_to_string(target.join("bin/tool")).unwrap(), "#!/bin/sh\n");
    }

    fn own_ids_as(container_uid: u32, container_gid: u32) -> IdMappings {
        let me = crate::filesystem::RootIds::current();
        IdMappings::new(
            vec![IdMap::new(container_uid, me.uid, 1)],
            vec![IdMap::new(container_gid, me.gid, 1)],
        )
    }

    fn archive_with(name: &str, uid: u64, gid: u64, mode: u32) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(4);
        header.set_mode(mode);
        header.set_uid(uid);
        header.set_gid(gid);
        builder.append_data(&mut header, name, &b"data"[..]).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn archive_owners_are_container_ids() {
        let temp = tempfile::tempdir().unwrap();
        write(&temp.path().join("etc/hostname"), "box");

        let bytes = write_archive(temp.path(), Vec::new(), &own_ids_as(5000, 6000)).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.header().uid().unwrap(), 5000);
            assert_eq!(entry.header().gid().unwrap(), 6000);
        }
    }

    #[test]
    fn unmapped_host_owner_cannot_be_archived() {
        let temp = tempfile::tempdir().unwrap();
        write(&temp.path().join("file"), "x");
        let me = crate::filesystem::RootIds::current();
        let elsewhere = IdMappings::new(vec![IdMap::new(0, me.uid.wrapping_add(1), 1)], vec![]);

        let err = write_archive(temp.path(), Vec::new(), &elsewhere).unwrap_err();
        assert!(matches!(err, StrataError::IdMapping { .. }));
    }

    #[test]
    fn applied_owners_are_host_ids() {
        let temp = tempfile::tempdir().unwrap();
        let bytes = archive_with("bin/tool", 5000, 6000, 0o750);
        let me = crate::filesystem::RootIds::current();

        apply_archive(bytes.as_slice(), temp.path(), &own_ids_as(5000, 6000)).unwrap();

        let meta = fs::metadata(temp.path().join("bin/tool")).unwrap();
        assert_eq!((meta.uid(), meta.gid()), (me.uid, me.gid));
        assert_eq!(meta.permissions().mode() & 0o7777, 0o750);
        assert_eq!(fs::read(temp.path().join("bin/tool")).unwrap(), b"data");
    }

    #[test]
    fn unmapped_container_owner_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let bytes = archive_with("file", 7, 7, 0o644);

        let err = apply_archive(bytes.as_slice(), temp.path(), &own_ids_as(5000, 6000)).unwrap_err();
        assert!(matches!(err, StrataError::IdMapping { .. }));
        assert!(!temp.path().join("file").exists());
    }

    #[test]
    fn changes_against_ancestors() {
        let temp = tempfile::tempdir().unwrap();
        let lower = temp.path().join("lower");
        let upper = temp.path().join("upper");
        write(&lower.join("etc/passwd"), "root");
        write(&lower.join("etc/group"), "root");
        write(&upper.join("etc/passwd"), "root\nuser");
        write(&upper.join("etc/.wh.group"), "");
        write(&upper.join("srv/new"), "data");
        write(&upper.join(".wh..wh.aufs"), "");

        let changes = changes(&[lower], &upper).unwrap();
        let rendered: Vec<String> = changes.iter().map(ToString::to_string).collect();

        assert!(rendered.contains(&"C /etc/passwd".to_string()));
        assert!(rendered.contains(&"D /etc/group".to_string()));
        assert!(rendered.contains(&"A /srv".to_string()));
        assert!(rendered.contains(&"A /srv/new".to_string()));
        assert!(!rendered.iter().any(|c| c.contains(".wh.")));
    }

    #[test]
    fn size_counts_hard_links_once() {
        let temp = tempfile::tempdir().unwrap();
        write(&temp.path().join("a"), "12345");
        write(&temp.path().join("sub/b"), "123");
        fs::hard_link(temp.path().join("a"), temp.path().join("sub/a-link")).unwrap();

        assert_eq!(directory_size(temp.path()).unwrap(), 8);
    }
}
