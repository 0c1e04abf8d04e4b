//! On-disk intermediate cache
//!
//! Layout under the cache root:
//!
//! ```text
//! entry.json          index of the single entry (commit point)
//! blobs/<key>.tar     serialized intermediate image
//! tmp/                staging area for in-flight writes
//! .lock               writer lock (fs2 exclusive)
//! ```
//!
//! A store moves the blob into `tmp/`, evicts the old entry, renames the blob
//! into `blobs/` and only then renames a fresh `entry.json` into place. A
//! reader that sees an index always finds the complete blob it describes,
//! which is re-verified by size and checksum before a hit is reported.

use crate::cache::{CacheEntry, CacheKey, IntermediateCache};
use crate::error::{DistError, DistResult};
use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "entry.json";
const LOCK_FILE: &str = ".lock";

/// Single-slot cache persisted in a local directory
pub struct DiskCache {
    root: PathBuf,
    // Serializes writers within this process; the file lock covers other processes.
    writer: Mutex<()>,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn blocking<T, F>(&self, f: F) -> DistResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Layout) -> DistResult<T> + Send + 'static,
    {
        let layout = Layout::new(self.root.clone());
        tokio::task::spawn_blocking(move || f(layout))
            .await
            .map_err(|e| DistError::Internal(format!("cache task failed: {}", e)))?
    }
}

#[async_trait]
impl IntermediateCache for DiskCache {
    async fn open(&self) -> DistResult<()> {
        let _guard = self.writer.lock().await;
        self.blocking(|layout| {
            layout.ensure()?;
            let _lock = layout.lock()?;
            layout.sweep_tmp();
            Ok(())
        })
        .await?;
        debug!("Opened intermediate cache at {}", self.root.display());
        Ok(())
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let wanted = key.clone();
        let result = self
            .blocking(move |layout| match layout.read_entry(&wanted) {
                Err(DistError::CacheCorrupt(reason)) => {
                    warn!("Ignoring corrupt cache entry: {}", reason);
                    layout.discard_corrupt(&wanted);
                    Ok(None)
                }
                other => other,
            })
            .await;

        match result {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cache lookup failed, treating as miss: {}", e);
                None
            }
        }
    }

    async fn store(&self, key: &CacheKey, blob: &Path) -> DistResult<CacheEntry> {
        let _guard = self.writer.lock().await;
        let key = key.clone();
        let blob = blob.to_path_buf();
        self.blocking(move |layout| layout.store(&key, &blob)).await
    }

    async fn evict_all(&self) -> DistResult<()> {
        let _guard = self.writer.lock().await;
        self.blocking(|layout| {
            layout.ensure()?;
            let _lock = layout.lock()?;
            layout.evict()
        })
        .await?;
        info!("Evicted intermediate cache at {}", self.root.display());
        Ok(())
    }

    async fn close(&self) -> DistResult<()> {
        let _guard = self.writer.lock().await;
        self.blocking(|layout| {
            if layout.root.exists() {
                let _lock = layout.lock()?;
                layout.sweep_tmp();
            }
            Ok(())
        })
        .await
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

/// Paths and blocking operations over one cache root
struct Layout {
    root: PathBuf,
}

/// Held exclusive lock on the cache root; released when the file closes
struct WriterLock {
    _file: File,
}

impl Layout {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn blob_path(&self, key: &CacheKey) -> PathBuf {
        self.blobs_dir().join(format!("{}.tar", key.as_str()))
    }

    fn unwritable(&self, source: io::Error) -> DistError {
        DistError::CacheUnwritable {
            path: self.root.clone(),
            source,
        }
    }

    /// Create the layout and prove it is writable
    fn ensure(&self) -> DistResult<()> {
        for dir in [self.root.clone(), self.blobs_dir(), self.tmp_dir()] {
            fs::create_dir_all(&dir).map_err(|e| self.unwritable(e))?;
        }

        let marker = self.tmp_dir().join(format!(".writable-{}", uuid::Uuid::new_v4()));
        fs::write(&marker, b"").map_err(|e| self.unwritable(e))?;
        let _ = fs::remove_file(&marker);
        Ok(())
    }

    fn lock(&self) -> DistResult<WriterLock> {
        let file = self.open_lock_file()?;
        file.lock_exclusive().map_err(|e| self.unwritable(e))?;
        Ok(WriterLock { _file: file })
    }

    fn try_lock(&self) -> Option<WriterLock> {
        let file = self.open_lock_file().ok()?;
        file.try_lock_exclusive().ok()?;
        Some(WriterLock { _file: file })
    }

    fn open_lock_file(&self) -> DistResult<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.root.join(LOCK_FILE))
            .map_err(|e| self.unwritable(e))
    }

    /// Read and verify the entry stored under `key`.
    ///
    /// `Ok(None)` is a plain miss; `Err(CacheCorrupt)` means the slot holds
    /// something for this key that cannot be trusted.
    fn read_entry(&self, key: &CacheKey) -> DistResult<Option<CacheEntry>> {
        let content = match fs::read_to_string(self.index_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Cache empty");
                return Ok(None);
            }
            Err(e) => {
                return Err(DistError::CacheCorrupt(format!(
                    "unreadable index {}: {}",
                    self.index_path().display(),
                    e
                )))
            }
        };

        let mut entry: CacheEntry = serde_json::from_str(&content)
            .map_err(|e| DistError::CacheCorrupt(format!("invalid index: {}", e)))?;

        if &entry.key != key {
            debug!(
                "Cache holds {} but {} was requested",
                entry.key.short(),
                key.short()
            );
            return Ok(None);
        }

        entry.blob = self.blob_path(key);
        let (sha256, size_bytes) = sha256_file(&entry.blob)
            .map_err(|e| DistError::CacheCorrupt(format!("unreadable blob: {}", e)))?;

        if size_bytes != entry.size_bytes {
            return Err(DistError::CacheCorrupt(format!(
                "blob is {} bytes, index says {}",
                size_bytes, entry.size_bytes
            )));
        }
        if sha256 != entry.sha256 {
            return Err(DistError::CacheCorrupt(format!(
                "blob checksum {} does not match index {}",
                &sha256[..12],
                &entry.sha256[..12.min(entry.sha256.len())]
            )));
        }

        Ok(Some(entry))
    }

    /// Drop a corrupt entry if no writer is active and it is still corrupt
    fn discard_corrupt(&self, key: &CacheKey) {
        let Some(_lock) = self.try_lock() else {
            debug!("Cache writer active, leaving corrupt entry for it to replace");
            return;
        };
        if matches!(self.read_entry(key), Err(DistError::CacheCorrupt(_))) {
            if let Err(e) = self.evict() {
                warn!("Failed to discard corrupt cache entry: {}", e);
            }
        }
    }

    fn store(&self, key: &CacheKey, blob: &Path) -> DistResult<CacheEntry> {
        self.ensure()?;
        let _lock = self.lock()?;

        // Another writer may have stored the same sources while we built.
        if let Ok(Some(existing)) = self.read_entry(key) {
            info!(
                "Cache already holds {}, discarding duplicate blob",
                key.short()
            );
            let _ = fs::remove_file(blob);
            return Ok(existing);
        }

        let tmp = self
            .tmp_dir()
            .join(format!("{}-{}.tar", key.short(), uuid::Uuid::new_v4()));
        move_file(blob, &tmp)
            .map_err(|e| DistError::io(format!("moving {} into cache", blob.display()), e))?;

        let (sha256, size_bytes) = match sha256_file(&tmp) {
            Ok(digest) => digest,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(DistError::io("hashing cache blob", e));
            }
        };

        self.evict()?;

        let blob_path = self.blob_path(key);
        fs::rename(&tmp, &blob_path).map_err(|e| self.unwritable(e))?;

        let entry = CacheEntry {
            key: key.clone(),
            blob: blob_path,
            size_bytes,
            sha256,
            created_at: Utc::now(),
        };
        self.write_index(&entry)?;

        info!(
            "Stored intermediate image {} ({} bytes)",
            key.short(),
            size_bytes
        );
        Ok(entry)
    }

    fn write_index(&self, entry: &CacheEntry) -> DistResult<()> {
        let content = serde_json::to_vec_pretty(entry)?;
        let tmp = self
            .tmp_dir()
            .join(format!("{}-{}", INDEX_FILE, uuid::Uuid::new_v4()));
        fs::write(&tmp, content).map_err(|e| self.unwritable(e))?;
        fs::rename(&tmp, self.index_path()).map_err(|e| self.unwritable(e))
    }

    /// Remove the index first so readers miss before the blob disappears
    fn evict(&self) -> DistResult<()> {
        match fs::remove_file(self.index_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(self.unwritable(e)),
        }

        let blobs = match fs::read_dir(self.blobs_dir()) {
            Ok(blobs) => blobs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.unwritable(e)),
        };
        for blob in blobs {
            let blob = blob.map_err(|e| self.unwritable(e))?;
            debug!("Evicting {}", blob.path().display());
            fs::remove_file(blob.path()).map_err(|e| self.unwritable(e))?;
        }
        Ok(())
    }

    /// Remove leftovers of interrupted writes; caller holds the lock
    fn sweep_tmp(&self) {
        let Ok(entries) = fs::read_dir(self.tmp_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            debug!("Removing stale cache file {}", entry.path().display());
            let _ = fs::remove_file(entry.path());
        }
    }
}

/// Rename, falling back to copy+remove across filesystems
fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
    }
}

fn sha256_file(path: &Path) -> io::Result<(String, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn key(c: char) -> CacheKey {
        CacheKey::from_hex(c.to_string().repeat(64))
    }

    fn blob_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    async fn open_cache(dir: &TempDir) -> DiskCache {
        let cache = DiskCache::new(dir.path().join("cache"));
        cache.open().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn lookup_empty_is_miss() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        assert!(cache.lookup(&key('a')).await.is_none());
    }

    #[tokio::test]
    async fn store_then_lookup_hits() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let blob = blob_file(dir.path(), "xen.tar", b"xen image");

        let stored = cache.store(&key('a'), &blob).await.unwrap();
        assert!(!blob.exists(), "blob should be moved into the store");
        assert_eq!(stored.size_bytes, 9);

        let entry = cache.lookup(&key('a')).await.unwrap();
        assert_eq!(entry.key, key('a'));
        assert_eq!(fs::read(&entry.blob).unwrap(), b"xen image");
    }

    #[tokio::test]
    async fn second_store_evicts_first() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;

        let a = blob_file(dir.path(), "a.tar", b"first");
        let b = blob_file(dir.path(), "b.tar", b"second");
        cache.store(&key('a'), &a).await.unwrap();
        cache.store(&key('b'), &b).await.unwrap();

        assert!(cache.lookup(&key('a')).await.is_none());
        let entry = cache.lookup(&key('b')).await.unwrap();
        assert_eq!(fs::read(&entry.blob).unwrap(), b"second");

        let blobs: Vec<_> = fs::read_dir(cache.root().join("blobs")).unwrap().collect();
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn store_same_key_keeps_existing() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;

        let first = blob_file(dir.path(), "1.tar", b"winner");
        let second = blob_file(dir.path(), "2.tar", b"loser!");
        cache.store(&key('a'), &first).await.unwrap();
        let entry = cache.store(&key('a'), &second).await.unwrap();

        assert_eq!(fs::read(&entry.blob).unwrap(), b"winner");
        assert!(!second.exists());
    }

    #[tokio::test]
    async fn evict_all_clears_slot() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let blob = blob_file(dir.path(), "xen.tar", b"xen");
        cache.store(&key('a'), &blob).await.unwrap();

        cache.evict_all().await.unwrap();
        assert!(cache.lookup(&key('a')).await.is_none());
    }

    #[tokio::test]
    async fn truncated_blob_is_miss_and_discarded() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let blob = blob_file(dir.path(), "xen.tar", b"full image contents");
        let entry = cache.store(&key('a'), &blob).await.unwrap();

        fs::write(&entry.blob, b"full").unwrap();

        assert!(cache.lookup(&key('a')).await.is_none());
        assert!(!cache.root().join(INDEX_FILE).exists());
    }

    #[tokio::test]
    async fn garbage_index_is_miss() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        fs::write(cache.root().join(INDEX_FILE), "{not json").unwrap();

        assert!(cache.lookup(&key('a')).await.is_none());
    }

    #[tokio::test]
    async fn open_sweeps_stale_tmp() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let stale = cache.root().join("tmp").join("half-written.tar");
        fs::write(&stale, b"partial").unwrap();

        cache.open().await.unwrap();
        assert!(!stale.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn open_unwritable_root_fails() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"").unwrap();

        let cache = DiskCache::new(file.join("cache"));
        let err = cache.open().await.unwrap_err();
        assert!(matches!(err, DistError::CacheUnwritable { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_stores_never_expose_partial_blob() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        let small = vec![b's'; 64 * 1024];
        let large = vec![b'L'; 512 * 1024];

        // Two independent handles, as two concurrent runs would have.
        let writer_a = Arc::new(DiskCache::new(&root));
        let writer_b = Arc::new(DiskCache::new(&root));
        writer_a.open().await.unwrap();

        let mut tasks = Vec::new();
        for round in 0..8 {
            for (cache, k, content) in [
                (writer_a.clone(), key('a'), small.clone()),
                (writer_b.clone(), key('b'), large.clone()),
            ] {
                let src = dir.path().join(format!("{}-{}.tar", k.short(), round));
                fs::write(&src, &content).unwrap();
                tasks.push(tokio::spawn(async move {
                    cache.store(&k, &src).await.unwrap();
                }));
            }
        }

        let reader = DiskCache::new(&root);
        for _ in 0..32 {
            for (k, expected) in [(key('a'), &small), (key('b'), &large)] {
                if let Some(entry) = reader.lookup(&k).await {
                    // The blob may be evicted between lookup and read; a
                    // successful read must be the complete blob.
                    if let Ok(bytes) = fs::read(&entry.blob) {
                        assert_eq!(&bytes, expected);
                    }
                }
            }
        }

        for task in tasks {
            task.await.unwrap();
        }
    }
}
