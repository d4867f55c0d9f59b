//! Two-tier image cache: a byte-budgeted memory LRU in front of a
//! checksummed, byte-budgeted disk store.

mod disk;
mod memory;

pub use disk::DiskTier;
pub use memory::MemoryTier;

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub disk_entries: usize,
    pub disk_bytes: u64,
}

#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<ImageCacheInner>,
}

struct ImageCacheInner {
    memory: Mutex<MemoryState>,
    disk: DiskTier,
    paused: AtomicBool,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
}

struct MemoryState {
    tier: MemoryTier,
    /// Keys put while paused that have not reached the disk yet.
    dirty: HashSet<String>,
    /// Bumped by every write or removal. A disk read only promotes its
    /// result when nothing was written while it ran.
    epoch: u64,
}

impl ImageCache {
    pub fn open(dir: impl Into<PathBuf>, memory_budget: usize, disk_budget: u64) -> Result<Self> {
        let disk = DiskTier::open(dir, disk_budget)?;
        Ok(ImageCache {
            inner: Arc::new(ImageCacheInner {
                memory: Mutex::new(MemoryState {
                    tier: MemoryTier::new(memory_budget),
                    dirty: HashSet::new(),
                    epoch: 0,
                }),
                disk,
                paused: AtomicBool::new(false),
                memory_hits: AtomicU64::new(0),
                disk_hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        })
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Memory-tier lookup only; never touches the disk.
    pub fn get_memory(&self, key: &str) -> Option<Bytes> {
        let bytes = self.inner.memory.lock().tier.get(key)?;
        self.inner.memory_hits.fetch_add(1, Ordering::Relaxed);
        log::debug!("cache memory hit {key}");
        Some(bytes)
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let epoch = self.inner.memory.lock().epoch;
        if let Some(bytes) = self.get_memory(key) {
            return Some(bytes);
        }

        if self.is_paused() {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let inner = self.inner.clone();
        let owned = key.to_string();
        let found = tokio::task::spawn_blocking(move || inner.disk.read(&owned))
            .await
            .ok()
            .flatten();

        match found {
            Some(bytes) => {
                self.inner.disk_hits.fetch_add(1, Ordering::Relaxed);
                log::debug!("cache disk hit {key}");
                self.promote(key, bytes.clone(), epoch);
                Some(bytes)
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores `bytes` under `key`, replacing any previous value. While paused
    /// the disk write is deferred until unpause or [`ImageCache::flush`].
    pub async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        let paused = self.is_paused();
        self.insert_memory(key.to_string(), bytes.clone(), paused);
        if paused {
            return Ok(());
        }
        self.write_disk(key.to_string(), bytes).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        {
            let mut memory = self.inner.memory.lock();
            memory.epoch += 1;
            memory.tier.remove(key);
            memory.dirty.remove(key);
        }
        let inner = self.inner.clone();
        let owned = key.to_string();
        let removed = tokio::task::spawn_blocking(move || inner.disk.remove(&owned))
            .await
            .map_err(|e| PipelineError::storage(e.to_string()))?;
        self.inner.memory.lock().epoch += 1;
        removed
    }

    /// Writes every pending entry to disk and empties the memory tier.
    pub async fn flush(&self) -> Result<()> {
        let pending: Vec<(String, Bytes)> = {
            let mut memory = self.inner.memory.lock();
            memory.epoch += 1;
            let dirty = std::mem::take(&mut memory.dirty);
            memory
                .tier
                .drain()
                .into_iter()
                .filter(|(key, _)| dirty.contains(key))
                .collect()
        };
        self.write_back(pending).await
    }

    /// Suspends disk reads and writes. Unpausing writes back whatever was
    /// put in the meantime and is still held in memory.
    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        let was = self.inner.paused.swap(paused, Ordering::AcqRel);
        if paused || !was {
            return Ok(());
        }

        let pending: Vec<(String, Bytes)> = {
            let mut memory = self.inner.memory.lock();
            let dirty = std::mem::take(&mut memory.dirty);
            dirty
                .into_iter()
                .filter_map(|key| memory.tier.get(&key).map(|bytes| (key, bytes)))
                .collect()
        };
        log::debug!("cache unpaused, writing back {} entries", pending.len());
        self.write_back(pending).await
    }

    /// Writes `pending` to disk in order. On a failed write, that entry and
    /// everything after it stay in memory marked dirty for the next attempt.
    async fn write_back(&self, pending: Vec<(String, Bytes)>) -> Result<()> {
        let mut pending = pending.into_iter();
        while let Some((key, bytes)) = pending.next() {
            if let Err(e) = self.write_disk(key.clone(), bytes.clone()).await {
                let mut guard = self.inner.memory.lock();
                let memory = &mut *guard;
                for (key, bytes) in std::iter::once((key, bytes)).chain(pending) {
                    match memory.tier.peek(&key) {
                        Some(held) if *held == bytes => {
                            memory.dirty.insert(key);
                        }
                        // A newer put of the same key took over.
                        Some(_) => {}
                        None => {
                            memory.dirty.insert(key.clone());
                            for evicted in memory.tier.insert(key, bytes) {
                                if memory.dirty.remove(&evicted) {
                                    log::debug!("cache dropped unwritten entry {evicted}");
                                }
                            }
                        }
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let memory = self.inner.memory.lock();
        CacheStats {
            memory_hits: self.inner.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.inner.disk_hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            memory_entries: memory.tier.len(),
            memory_bytes: memory.tier.bytes_used(),
            disk_entries: self.inner.disk.len(),
            disk_bytes: self.inner.disk.bytes_used(),
        }
    }

    /// Caches a disk hit in memory unless a write or removal happened
    /// since `epoch`, in which case the bytes read may already be stale.
    fn promote(&self, key: &str, bytes: Bytes, epoch: u64) {
        let mut memory = self.inner.memory.lock();
        if memory.epoch != epoch {
            return;
        }
        for evicted in memory.tier.insert(key.to_string(), bytes) {
            if memory.dirty.remove(&evicted) {
                log::debug!("cache dropped unwritten entry {evicted}");
            }
        }
    }

    fn insert_memory(&self, key: String, bytes: Bytes, dirty: bool) {
        let mut memory = self.inner.memory.lock();
        memory.epoch += 1;
        if dirty {
            memory.dirty.insert(key.clone());
        } else {
            memory.dirty.remove(&key);
        }
        for evicted in memory.tier.insert(key, bytes) {
            if memory.dirty.remove(&evicted) {
                log::debug!("cache dropped unwritten entry {evicted}");
            }
        }
    }

    async fn write_disk(&self, key: String, bytes: Bytes) -> Result<()> {
        let inner = self.inner.clone();
        let written = tokio::task::spawn_blocking(move || inner.disk.write(&key, &bytes))
            .await
            .map_err(|e| PipelineError::storage(e.to_string()))?;
        self.inner.memory.lock().epoch += 1;
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &std::path::Path) -> ImageCache {
        ImageCache::open(dir, 1024, 1 << 20).unwrap()
    }

    #[tokio::test]
    async fn get_after_put_returns_exact_bytes() {
        let temp = tempfile::tempdir().unwrap();
        let cache = open(temp.path());

        cache.put("k", Bytes::from_static(b"first")).await.unwrap();
        cache.put("k", Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Bytes::from_static(b"second"));
        assert_eq!(cache.stats().memory_entries, 1);
    }

    #[tokio::test]
    async fn disk_hit_is_promoted_to_memory() {
        let temp = tempfile::tempdir().unwrap();
        {
            let cache = open(temp.path());
            cache.put("k", Bytes::from_static(b"persisted")).await.unwrap();
        }

        let cache = open(temp.path());
        assert_eq!(cache.stats().memory_entries, 0);
        assert_eq!(cache.get("k").await.unwrap(), Bytes::from_static(b"persisted"));
        assert_eq!(cache.stats().disk_hits, 1);

        cache.get("k").await.unwrap();
        assert_eq!(cache.stats().memory_hits, 1);
    }

    #[tokio::test]
    async fn paused_cache_defers_disk_until_unpaused() {
        let temp = tempfile::tempdir().unwrap();
        let cache = open(temp.path());

        cache.set_paused(true).await.unwrap();
        cache.put("k", Bytes::from_static(b"scrolling")).await.unwrap();
        assert_eq!(cache.stats().disk_entries, 0);
        assert!(cache.get("k").await.is_some());

        cache.set_paused(false).await.unwrap();
        assert_eq!(cache.stats().disk_entries, 1);
    }

    #[tokio::test]
    async fn paused_cache_does_not_read_disk() {
        let temp = tempfile::tempdir().unwrap();
        let cache = open(temp.path());
        cache.put("k", Bytes::from_static(b"on disk")).await.unwrap();
        cache.flush().await.unwrap();

        cache.set_paused(true).await.unwrap();
        assert!(cache.get("k").await.is_none());
        cache.set_paused(false).await.unwrap();
        assert!(cache.get("k").await.is_some());
    }

    #[tokio::test]
    async fn flush_writes_back_and_truncates_memory() {
        let temp = tempfile::tempdir().unwrap();
        let cache = open(temp.path());

        cache.set_paused(true).await.unwrap();
        cache.put("a", Bytes::from_static(b"alpha")).await.unwrap();
        cache.put("b", Bytes::from_static(b"beta")).await.unwrap();
        cache.flush().await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.disk_entries, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_disk_read_never_shadows_a_newer_put() {
        let temp = tempfile::tempdir().unwrap();
        let cache = open(temp.path());

        for round in 0..200 {
            let key = format!("k{round}");
            cache.put(&key, Bytes::from_static(b"old")).await.unwrap();
            cache.flush().await.unwrap();

            let reader = {
                let cache = cache.clone();
                let key = key.clone();
                tokio::spawn(async move { cache.get(&key).await })
            };
            let writer = {
                let cache = cache.clone();
                let key = key.clone();
                tokio::spawn(async move { cache.put(&key, Bytes::from_static(b"new")).await })
            };
            reader.await.unwrap();
            writer.await.unwrap().unwrap();

            assert_eq!(cache.get(&key).await.unwrap(), Bytes::from_static(b"new"), "round {round}");
        }
    }

    #[tokio::test]
    async fn oversized_put_does_not_leave_the_old_value_behind() {
        let temp = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(temp.path(), 64, 256).unwrap();

        cache.put("k", Bytes::from_static(b"old")).await.unwrap();
        cache.put("k", Bytes::from(vec![7u8; 1000])).await.unwrap();
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.stats().disk_entries, 0);
    }

    #[tokio::test]
    async fn failed_write_back_keeps_the_rest_pending() {
        let temp = tempfile::tempdir().unwrap();
        let cache = open(temp.path());
        let keys: Vec<String> = (0..6).map(|i| format!("page-{i}")).collect();

        cache.set_paused(true).await.unwrap();
        for key in &keys {
            cache.put(key, Bytes::from(key.clone().into_bytes())).await.unwrap();
        }
        // A file where the shard directory should be makes that write fail.
        let shard = cache.inner.disk.path_for(&keys[0]).parent().unwrap().to_path_buf();
        std::fs::write(&shard, b"not a directory").unwrap();
        assert!(cache.flush().await.is_err());

        std::fs::remove_file(&shard).unwrap();
        cache.flush().await.unwrap();
        assert_eq!(cache.stats().memory_entries, 0);
        for key in &keys {
            assert_eq!(cache.get(key).await.unwrap(), Bytes::from(key.clone().into_bytes()));
        }
    }

    #[tokio::test]
    async fn remove_clears_both_tiers() {
        let temp = tempfile::tempdir().unwrap();
        let cache = open(temp.path());
        cache.put("k", Bytes::from_static(b"gone soon")).await.unwrap();
        cache.remove("k").await.unwrap();
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.stats().disk_entries, 0);
    }
}
