//! # strata-common
//!
//! Shared types for the Strata layered filesystem driver.
//!
//! This crate provides the pieces every Strata crate agrees on:
//! - Layer ID validation and generation
//! - The on-disk directory layout of a driver root
//! - The common error taxonomy

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{StrataError, StrataResult};
pub use id::LayerId;
pub use paths::LayerPaths;
