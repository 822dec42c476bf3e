//! Common error types for the Strata driver.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StrataError`].
pub type StrataResult<T> = Result<T, StrataError>;

/// Errors raised by the layered filesystem driver.
#[derive(Error, Diagnostic, Debug)]
pub enum StrataError {
    /// The host kernel does not provide the union filesystem.
    #[error("AUFS was not found in /proc/filesystems")]
    #[diagnostic(
        code(strata::driver::not_supported),
        help("Load the aufs kernel module or pick another storage driver")
    )]
    NotSupported,

    /// The driver root sits on a filesystem that cannot back union branches.
    #[error("Backing filesystem {fs_name} is incompatible with aufs")]
    #[diagnostic(code(strata::driver::incompatible_fs))]
    IncompatibleBackingFilesystem {
        /// Name of the detected backing filesystem.
        fs_name: String,
    },

    /// A per-layer storage option was requested.
    #[error("Storage option {option} is not supported by aufs")]
    #[diagnostic(code(strata::layer::unsupported_option))]
    UnsupportedOption {
        /// The rejected option key.
        option: String,
    },

    /// Layer metadata or directory is missing.
    #[error("Layer does not exist: {id}")]
    #[diagnostic(code(strata::layer::not_found))]
    NotExist {
        /// The layer ID that was not found.
        id: String,
    },

    /// A layer with this ID is already registered.
    #[error("Layer already exists: {id}")]
    #[diagnostic(code(strata::layer::already_exists))]
    AlreadyExists {
        /// The duplicated layer ID.
        id: String,
    },

    /// Invalid layer ID format.
    #[error("Invalid layer ID: {id:?}")]
    #[diagnostic(
        code(strata::layer::invalid_id),
        help("Layer IDs are single path components: no '/', no NUL, not '.' or '..'")
    )]
    InvalidLayerId {
        /// The invalid layer ID.
        id: String,
    },

    /// A mount, remount or unmount call failed.
    #[error("Mount operation on {} failed: {source}", target.display())]
    #[diagnostic(code(strata::mount))]
    MountFailure {
        /// Mount target the call was issued against.
        target: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Moving a layer directory out of the visible namespace failed.
    #[error("Failed to rename {} to {}: {source}", from.display(), to.display())]
    #[diagnostic(
        code(strata::layer::rename),
        help("Removal is safe to retry until it reports success")
    )]
    RenameFailure {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// UID/GID mapping could not be resolved.
    #[error("ID mapping error: {message}")]
    #[diagnostic(
        code(strata::idmap),
        help("Maps use the container:host:size format and must map container root")
    )]
    IdMapping {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(strata::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(strata::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(strata::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(strata::internal),
        help("This is a bug, please report it")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl StrataError {
    /// Whether this error means "the thing is missing".
    ///
    /// Covers both [`StrataError::NotExist`] and raw I/O `NotFound` errors.
    #[must_use]
    pub fn is_not_exist(&self) -> bool {
        match self {
            Self::NotExist { .. } => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}
