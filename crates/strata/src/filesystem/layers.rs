//! Layer existence and parent-chain metadata.
//!
//! Each layer owns a record file under `layers/` listing its ancestors,
//! nearest first, one ID per line. A child's record is its parent's ID
//! followed by the parent's own chain, so the whole chain is available
//! without walking the records transitively.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use strata_common::{LayerId, LayerPaths, StrataError, StrataResult};

use super::ownership::{RootIds, make_dir_all_as};

/// Mode of per-layer directories.
const LAYER_DIR_MODE: u32 = 0o755;

/// Ordered ancestors of a layer, nearest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentChain(Vec<LayerId>);

impl ParentChain {
    /// Chain of a layer whose immediate parent is `parent`.
    #[must_use]
    pub fn child_of(parent: LayerId, parent_chain: &ParentChain) -> Self {
        let mut ids = Vec::with_capacity(parent_chain.len() + 1);
        ids.push(parent);
        ids.extend(parent_chain.0.iter().cloned());
        Self(ids)
    }

    /// Parse record file contents.
    pub fn parse(content: &str) -> StrataResult<Self> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(LayerId::new)
            .collect::<StrataResult<Vec<_>>>()
            .map(Self)
    }

    /// Record file contents for this chain.
    #[must_use]
    pub fn to_record(&self) -> String {
        self.0.iter().fold(String::new(), |mut out, id| {
            out.push_str(id.as_str());
            out.push('\n');
            out
        })
    }

    /// Immediate parent.
    #[must_use]
    pub fn parent(&self) -> Option<&LayerId> {
        self.0.first()
    }

    /// Ancestor IDs, nearest first.
    #[must_use]
    pub fn ids(&self) -> &[LayerId] {
        &self.0
    }

    /// Number of ancestors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the layer has no ancestors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// On-disk store of layer directories and records.
#[derive(Debug, Clone)]
pub struct LayerStore {
    /// Root layout.
    paths: LayerPaths,
    /// Owner of created directories.
    owner: RootIds,
}

impl LayerStore {
    /// Create a layer store over an existing root layout.
    #[must_use]
    pub fn new(paths: LayerPaths, owner: RootIds) -> Self {
        Self { paths, owner }
    }

    /// The root layout.
    #[must_use]
    pub fn paths(&self) -> &LayerPaths {
        &self.paths
    }

    /// Register a new layer on top of `parent`.
    ///
    /// Storage options are not supported; any option is rejected before
    /// anything touches the disk. The parent must already exist.
    pub fn create(
        &self,
        id: &LayerId,
        parent: Option<&LayerId>,
        storage_opts: &HashMap<String, String>,
    ) -> StrataResult<ParentChain> {
        if let Some(option) = storage_opts.keys().min() {
            return Err(StrataError::UnsupportedOption {
                option: option.clone(),
            });
        }

        if self.exists(id.as_str()) {
            return Err(StrataError::AlreadyExists {
                id: id.to_string(),
            });
        }

        let chain = match parent {
            Some(parent) => ParentChain::child_of(parent.clone(), &self.parent_chain(parent.as_str())?),
            None => ParentChain::default(),
        };

        make_dir_all_as(&self.paths.mount_point(id.as_str()), LAYER_DIR_MODE, self.owner)?;
        make_dir_all_as(&self.paths.diff_dir(id.as_str()), LAYER_DIR_MODE, self.owner)?;
        fs::write(self.paths.layer_record(id.as_str()), chain.to_record())?;

        tracing::debug!(
            layer_id = %id,
            parent = ?chain.parent().map(LayerId::as_str),
            depth = chain.len(),
            "Layer created"
        );
        Ok(chain)
    }

    /// Whether a record exists for `id`.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        fs::symlink_metadata(self.paths.layer_record(id)).is_ok()
    }

    /// Read the ancestors of `id`.
    ///
    /// A missing record yields [`StrataError::NotExist`].
    pub fn parent_chain(&self, id: &str) -> StrataResult<ParentChain> {
        match fs::read_to_string(self.paths.layer_record(id)) {
            Ok(content) => ParentChain::parse(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StrataError::NotExist { id: id.to_string() }),
            Err(e) => Err(e.into()),
        }
    }

    /// Diff directories of the ancestors of `id`, nearest first.
    pub fn ancestor_paths(&self, id: &str) -> StrataResult<Vec<PathBuf>> {
        Ok(self
            .parent_chain(id)?
            .ids()
            .iter()
            .map(|ancestor| self.paths.diff_dir(ancestor.as_str()))
            .collect())
    }

    /// Delete the record of `id`; a missing record is not an error.
    pub fn remove_record(&self, id: &str) -> StrataResult<()> {
        match fs::remove_file(self.paths.layer_record(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// IDs of all registered layers.
    pub fn list(&self) -> StrataResult<Vec<String>> {
        let mut ids = Vec::new();

        for entry in fs::read_dir(self.paths.layers())? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }
}
