//! # Strata
//!
//! Strata is an aufs layer driver: it stacks a chain of read-only image
//! layers under one writable layer to materialize container root
//! filesystems.
//!
//! ## Features
//!
//! - **Parent chains**: every layer records its full ancestry, nearest first
//! - **Union mounts**: ancestor chains of any length, packed into as few
//!   mount calls as the kernel's one-page option limit allows
//! - **Idempotent mounts**: driver-wide serialized mount and unmount
//! - **Two-phase removal**: layers vanish by rename before their trees are deleted
//!
//! ## Usage
//!
//! ```no_run
//! use std::collections::HashMap;
//!
//! use strata::driver::{Driver, DriverConfig};
//!
//! # fn example() -> strata_common::StrataResult<()> {
//! let driver = Driver::init(DriverConfig::default().with_root("/var/lib/strata/aufs"))?;
//!
//! driver.create("base", "", &HashMap::new())?;
//! driver.create("app", "base", &HashMap::new())?;
//!
//! // Mounts diff/app over diff/base on mnt/app
//! let rootfs = driver.get("app", "")?;
//! println!("{}", rootfs.display());
//!
//! driver.put("app")?;
//! driver.remove("app")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod driver;
pub mod filesystem;

pub use driver::{Driver, DriverConfig};
