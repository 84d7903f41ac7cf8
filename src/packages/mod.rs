// src/packages/mod.rs

//! Package metadata extraction
//!
//! The package archive itself is opaque to pkgpool. Metadata is obtained
//! through a `MetadataReader`; the default reader runs an external tool.

pub mod command;
pub mod traits;

pub use command::CommandMetadataReader;
pub use traits::{MetadataReader, PackageMetadata};

/// File suffix of full packages
pub const PACKAGE_SUFFIX: &str = ".eopkg";

/// File suffix of delta packages
pub const DELTA_SUFFIX: &str = ".delta.eopkg";

/// Whether a file name looks like a delta package
pub fn is_delta_name(name: &str) -> bool {
    name.ends_with(DELTA_SUFFIX)
}
