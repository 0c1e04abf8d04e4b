//! Content keys for the intermediate cache
//!
//! Hashes the tracked source subtrees into a single digest. Same source
//! content = same key, regardless of timestamps or permissions.

use crate::error::{DistError, DistResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Directory names never hashed into a key
const IGNORED_NAMES: &[&str] = &[".git"];

/// Deterministic digest of the intermediate stage's source inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an existing hex digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines and image tags
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the cache key for a set of source paths.
///
/// Each path may be a file or a directory. Roots are hashed in sorted order
/// and directory walks are sorted by name, so the key only depends on
/// relative paths, file bytes and symlink targets.
pub fn compute_key(source_paths: &[PathBuf]) -> DistResult<CacheKey> {
    let mut roots: Vec<&PathBuf> = source_paths.iter().collect();
    roots.sort();
    roots.dedup();

    let mut hasher = Sha256::new();
    let mut files = 0usize;

    for root in roots {
        if fs::symlink_metadata(root).is_err() {
            return Err(DistError::InputUnavailable(root.clone()));
        }

        hasher.update(b"root\0");
        hasher.update(root_label(root).as_bytes());
        hasher.update(b"\0");

        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_ignored(e.file_name().to_str()));

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                match e.into_io_error() {
                    Some(source) => DistError::io(format!("walking {}", path.display()), source),
                    None => DistError::InputUnavailable(path),
                }
            })?;

            let rel = relative_name(root, entry.path());
            let file_type = entry.file_type();

            if file_type.is_symlink() {
                let target = fs::read_link(entry.path()).map_err(|e| {
                    DistError::io(format!("reading link {}", entry.path().display()), e)
                })?;
                hasher.update(b"link\0");
                hasher.update(rel.as_bytes());
                hasher.update(b"\0");
                hasher.update(target.to_string_lossy().as_bytes());
                hasher.update(b"\0");
                files += 1;
            } else if file_type.is_file() {
                hash_file(&mut hasher, &rel, entry.path())?;
                files += 1;
            }
        }
    }

    let key = CacheKey(hex::encode(hasher.finalize()));
    debug!("Hashed {} source files into key {}", files, key.short());
    Ok(key)
}

fn hash_file(hasher: &mut Sha256, rel: &str, path: &Path) -> DistResult<()> {
    let contents = fs::read(path)
        .map_err(|e| DistError::io(format!("reading source file {}", path.display()), e))?;

    hasher.update(b"file\0");
    hasher.update(rel.as_bytes());
    hasher.update(b"\0");
    hasher.update((contents.len() as u64).to_le_bytes());
    hasher.update(&contents);
    Ok(())
}

fn is_ignored(name: Option<&str>) -> bool {
    name.map(|n| IGNORED_NAMES.contains(&n)).unwrap_or(false)
}

/// Last component of a root, so the key survives moving the checkout
fn root_label(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Path relative to its root with `/` separators
fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
