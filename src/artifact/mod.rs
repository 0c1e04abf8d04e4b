//! Produced package files
//!
//! Packages larger than the upload size threshold are gzipped by the recipe
//! and renamed with the compression marker, so `pkg.deb` arrives as
//! `pkg.deb.gz__`. Stripping the marker and decompressing recovers the
//! original file byte for byte.

pub mod normalize;

pub use normalize::{ArtifactNormalizer, NormalizeReport};

use crate::error::{DistError, DistResult};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// File name suffix marking a gzip-compressed artifact
pub const COMPRESSION_MARKER: &str = ".gz__";

/// One produced package file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub compressed: bool,
}

impl ArtifactFile {
    /// Stat a file on disk
    pub fn inspect(path: &Path) -> DistResult<Self> {
        let metadata = fs::metadata(path)
            .map_err(|e| DistError::io(format!("reading metadata of {}", path.display()), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            size_bytes: metadata.len(),
            compressed: is_compressed_name(path),
        })
    }

    /// File name as it was before upstream compression
    pub fn logical_name(&self) -> Option<String> {
        let name = self.path.file_name()?.to_str()?;
        Some(logical_name(name).to_string())
    }
}

/// Whether a path carries the compression marker
pub fn is_compressed_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.len() > COMPRESSION_MARKER.len() && n.ends_with(COMPRESSION_MARKER))
        .unwrap_or(false)
}

/// Strip the compression marker from a file name, if present
pub fn logical_name(name: &str) -> &str {
    match name.strip_suffix(COMPRESSION_MARKER) {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => name,
    }
}

/// Compress `path` into `<path>.gz__` if it is larger than `threshold` bytes.
///
/// The original file is replaced. Returns the new path, or `None` when the
/// file was small enough to leave alone.
pub fn compress_oversized(path: &Path, threshold: u64) -> DistResult<Option<PathBuf>> {
    let size = fs::metadata(path)
        .map_err(|e| DistError::io(format!("reading metadata of {}", path.display()), e))?
        .len();
    if size <= threshold {
        return Ok(None);
    }

    let mut marked = path.as_os_str().to_owned();
    marked.push(COMPRESSION_MARKER);
    let marked = PathBuf::from(marked);

    gzip_file(path, &marked)
        .map_err(|e| DistError::io(format!("compressing {}", path.display()), e))?;
    fs::remove_file(path)
        .map_err(|e| DistError::io(format!("removing {}", path.display()), e))?;

    Ok(Some(marked))
}

fn gzip_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(src)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(dst)?), Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.flush()
}
