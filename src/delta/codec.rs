// src/delta/codec.rs

//! Built-in delta generator
//!
//! Encodes the new package with zstd using the old package as a raw-content
//! dictionary. Applying the delta needs the old package and yields the new
//! one byte for byte.

use crate::delta::{DeltaGenerator, DeltaRequest};
use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::debug;

/// zstd dictionary-based delta generator
#[derive(Debug, Clone)]
pub struct ZstdDeltaGenerator {
    level: i32,
}

impl ZstdDeltaGenerator {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdDeltaGenerator {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_DELTA_LEVEL)
    }
}

impl DeltaGenerator for ZstdDeltaGenerator {
    fn generate(&self, request: &DeltaRequest<'_>) -> Result<Vec<PathBuf>> {
        let dictionary = fs::read(request.old).map_err(|e| Error::io("Failed to read", request.old, e))?;
        let new_size = fs::metadata(request.new)
            .map_err(|e| Error::io("Failed to stat", request.new, e))?
            .len();

        let out_path = request.work_dir.join(request.delta_name);
        let out = File::create(&out_path).map_err(|e| Error::io("Failed to create", &out_path, e))?;

        let mut encoder = zstd::stream::Encoder::with_dictionary(BufWriter::new(out), self.level, &dictionary)
            .map_err(|e| Error::DeltaError(format!("Failed to start encoder: {}", e)))?;
        let mut input = File::open(request.new).map_err(|e| Error::io("Failed to open", request.new, e))?;
        io::copy(&mut input, &mut encoder).map_err(|e| Error::io("Failed to encode", request.new, e))?;
        encoder
            .finish()
            .and_then(|mut w| io::Write::flush(&mut w))
            .map_err(|e| Error::io("Failed to write", &out_path, e))?;

        let delta_size = fs::metadata(&out_path)
            .map_err(|e| Error::io("Failed to stat", &out_path, e))?
            .len();
        debug!("Delta {} is {} bytes (target {} bytes)", request.delta_name, delta_size, new_size);

        // Not worth shipping
        if delta_size >= new_size {
            fs::remove_file(&out_path).map_err(|e| Error::io("Failed to remove", &out_path, e))?;
            return Ok(Vec::new());
        }

        Ok(vec![out_path])
    }
}

/// Rebuild the new package from `old` and a delta produced by `ZstdDeltaGenerator`
pub fn apply_delta(old: &Path, delta: &Path, out: &Path) -> Result<()> {
    let dictionary = fs::read(old).map_err(|e| Error::io("Failed to read", old, e))?;
    let input = File::open(delta).map_err(|e| Error::io("Failed to open", delta, e))?;

    let mut decoder = zstd::stream::Decoder::with_dictionary(BufReader::new(input), &dictionary)
        .map_err(|e| Error::DeltaError(format!("Failed to start decoder: {}", e)))?;
    let mut output = File::create(out).map_err(|e| Error::io("Failed to create", out, e))?;
    io::copy(&mut decoder, &mut output).map_err(|e| Error::io("Failed to decode", delta, e))?;

    Ok(())
}
