// src/config.rs

//! Runtime configuration
//!
//! Everything is supplied on the command line; there are no config files.

use std::path::PathBuf;

/// Default base directory holding the pool, repositories and databases
pub const DEFAULT_BASE_DIR: &str = "./repo";

/// Default tool used to extract package metadata as JSON
pub const DEFAULT_METADATA_TOOL: &str = "eopkg-metadata";

/// Default zstd level for generated deltas
pub const DEFAULT_DELTA_LEVEL: i32 = 19;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the repository tree (`<base>/pool`, `<base>/<repo>`, `<base>/<repo>.db`)
    pub base_dir: PathBuf,
    /// Program invoked to read artifact metadata
    pub metadata_tool: String,
    /// Extra arguments placed before the artifact path
    pub metadata_args: Vec<String>,
    /// Compression level for the built-in delta generator
    pub delta_level: i32,
}

impl Config {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            metadata_tool: DEFAULT_METADATA_TOOL.to_string(),
            metadata_args: Vec::new(),
            delta_level: DEFAULT_DELTA_LEVEL,
        }
    }
}
