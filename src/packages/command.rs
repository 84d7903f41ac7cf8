// src/packages/command.rs

//! Metadata extraction through an external tool
//!
//! The tool is invoked as `<program> [args...] <artifact>` and must print a
//! single JSON object on stdout:
//!
//! ```json
//! {"name": "nano", "source": "nano", "version": "2.4.2", "release": 12,
//!  "architecture": "x86_64", "distribution_release": "1"}
//! ```

use crate::error::{Error, Result};
use crate::packages::traits::{MetadataReader, PackageMetadata};
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Runs an external program to read package metadata
#[derive(Debug, Clone)]
pub struct CommandMetadataReader {
    program: String,
    args: Vec<String>,
}

impl CommandMetadataReader {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments placed before the artifact path
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl MetadataReader for CommandMetadataReader {
    fn read(&self, path: &Path) -> Result<PackageMetadata> {
        debug!("Reading metadata of {} with {}", path.display(), self.program);

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .output()
            .map_err(|e| {
                Error::MetadataError(format!("Failed to run {}: {}", self.program, e))
            })?;

        if !output.status.success() {
            return Err(Error::MetadataError(format!(
                "{} failed on {} ({}): {}",
                self.program,
                path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::MetadataError(format!(
                "Invalid metadata for {}: {}",
                path.display(),
                e
            ))
        })
    }
}
