//! Layer ID generation and validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{StrataError, StrataResult};

/// A validated layer ID.
///
/// Layer IDs are otherwise opaque, but each one names a directory under
/// every per-root subdirectory, so it must be a single path component:
/// - Non-empty
/// - No `/` and no NUL byte
/// - Not `.` or `..`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(String);

impl LayerId {
    /// Length of a truncated ID as shown in logs.
    pub const SHORT_LENGTH: usize = 12;

    /// Create a new layer ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID cannot be used as a directory name.
    pub fn new(id: impl Into<String>) -> StrataResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Generate a new random layer ID.
    ///
    /// The ID is a 64-character hex string built from two UUID v4 values.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        bytes[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        bytes[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self(hex::encode(bytes))
    }

    /// Get the layer ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> StrataResult<()> {
        let invalid = id.is_empty()
            || id == "."
            || id == ".."
            || id.contains('/')
            || id.contains('\0');

        if invalid {
            return Err(StrataError::InvalidLayerId { id: id.to_string() });
        }
        Ok(())
    }

    /// Returns a short version of the ID (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        truncate_id(&self.0)
    }
}

/// Truncate any ID-like string to [`LayerId::SHORT_LENGTH`] characters.
#[must_use]
pub fn truncate_id(id: &str) -> &str {
    match id.char_indices().nth(LayerId::SHORT_LENGTH) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LayerId {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for LayerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
