//! Intermediate build cache
//!
//! Stores the serialized image of the expensive intermediate stage (the
//! from-source Xen build), keyed by a content hash of its sources.
//!
//! # Model
//!
//! - Single slot: storing an entry evicts whatever was there, whatever its key
//! - Lookups match the full key only; no partial matching
//! - A corrupt entry is a miss, never an error
//! - Stores are atomic with respect to lookups and serialize among themselves
//!
//! | Outcome | Builder action |
//! |---------|----------------|
//! | Hit | load the stored image |
//! | Miss | build the stage, then store it |
//! | Corrupt | logged, handled as a miss |

pub mod disk;
pub mod key;
pub mod memory;

pub use disk::DiskCache;
pub use key::{compute_key, CacheKey};
pub use memory::MemoryCache;

use crate::error::DistResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The one entry a cache holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key of the sources the blob was built from
    pub key: CacheKey,
    /// Serialized image (tar archive as written by the engine)
    pub blob: PathBuf,
    /// Blob size in bytes
    pub size_bytes: u64,
    /// SHA256 of the blob contents
    pub sha256: String,
    /// When the entry was stored
    pub created_at: DateTime<Utc>,
}

/// Single-slot store for the intermediate stage image
///
/// Injected into the orchestrator so tests can swap the disk store for
/// [`MemoryCache`].
#[async_trait]
pub trait IntermediateCache: Send + Sync {
    /// Prepare the store for a run
    async fn open(&self) -> DistResult<()>;

    /// Return the entry if it was stored under exactly `key`
    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry>;

    /// Replace the slot's contents with `blob`, stored under `key`.
    ///
    /// Implementations may take the blob file over: the disk store moves it
    /// into its blob directory, the memory store references it in place.
    /// Callers must not modify or reuse `blob` afterwards.
    async fn store(&self, key: &CacheKey, blob: &Path) -> DistResult<CacheEntry>;

    /// Drop any stored entry
    async fn evict_all(&self) -> DistResult<()>;

    /// Flush and release the store at the end of a run
    async fn close(&self) -> DistResult<()>;

    /// Human-readable location for log lines
    fn location(&self) -> String;
}
