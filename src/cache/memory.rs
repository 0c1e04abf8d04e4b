//! In-memory intermediate cache
//!
//! Same single-slot semantics as [`DiskCache`](super::DiskCache) without
//! touching a cache directory. Blobs are referenced in place, not copied.

use crate::cache::{CacheEntry, CacheKey, IntermediateCache};
use crate::error::{DistError, DistResult};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Single-slot cache held in process memory
#[derive(Default)]
pub struct MemoryCache {
    slot: RwLock<Option<CacheEntry>>,
    stores: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `store` calls
    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    /// Current entry, whatever its key
    pub async fn current(&self) -> Option<CacheEntry> {
        self.slot.read().await.clone()
    }
}

#[async_trait]
impl IntermediateCache for MemoryCache {
    async fn open(&self) -> DistResult<()> {
        Ok(())
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.slot
            .read()
            .await
            .as_ref()
            .filter(|entry| &entry.key == key)
            .cloned()
    }

    async fn store(&self, key: &CacheKey, blob: &Path) -> DistResult<CacheEntry> {
        let bytes = tokio::fs::read(blob)
            .await
            .map_err(|e| DistError::io(format!("reading blob {}", blob.display()), e))?;

        let entry = CacheEntry {
            key: key.clone(),
            blob: blob.to_path_buf(),
            size_bytes: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(&bytes)),
            created_at: Utc::now(),
        };

        *self.slot.write().await = Some(entry.clone());
        self.stores.fetch_add(1, Ordering::SeqCst);
        Ok(entry)
    }

    async fn evict_all(&self) -> DistResult<()> {
        *self.slot.write().await = None;
        Ok(())
    }

    async fn close(&self) -> DistResult<()> {
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
