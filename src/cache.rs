//! Bounded on-disk cache of index blobs (§4.4). Content-addressed by
//! SHA-256 of the datarange tuple, which is why cache coherence needs no
//! cross-process coordination: the tuple only changes when a datarange is
//! replaced by aggregation, which mints a brand new key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::s3client::S3Capability;

/// Stable for the lifetime of a datarange; the tuple it hashes is
/// immutable, so the key never needs to change out from under a reader.
pub fn cache_key(dataset: &str, min_key: i64, max_key: i64, upload_counter: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dataset.as_bytes());
    hasher.update(b"\0");
    hasher.update(min_key.to_be_bytes());
    hasher.update(max_key.to_be_bytes());
    hasher.update(upload_counter.to_be_bytes());
    hex::encode(hasher.finalize())
}

struct Inner {
    order: LruCache<String, u64>,
    used_bytes: u64,
}

/// One in-flight fetch, shared by every concurrent caller asking for the
/// same key (§4.4 single-flight, §8 Scenario F).
struct InFlight {
    guard: Arc<Mutex<()>>,
}

pub struct IndexCache {
    dir: PathBuf,
    capacity_bytes: u64,
    state: Mutex<Inner>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl IndexCache {
    /// Rebuilds LRU order from file mtimes at startup (§4.4 persistence)
    /// and evicts until within capacity.
    pub async fn open(dir: PathBuf, capacity_bytes: u64) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Fatal(anyhow::anyhow!("cannot create cache dir {}: {e}", dir.display())))?;

        let mut entries: Vec<(String, u64, std::time::SystemTime)> = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::Fatal(anyhow::anyhow!("cannot read cache dir {}: {e}", dir.display())))?;
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| Error::Fatal(e.into()))? {
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            entries.push((name, meta.len(), mtime));
        }
        entries.sort_by_key(|(_, _, mtime)| *mtime);

        let mut order = LruCache::unbounded();
        let mut used_bytes = 0u64;
        for (name, size, _) in entries {
            order.put(name.clone(), size);
            used_bytes += size;
        }

        let cache = Self {
            dir,
            capacity_bytes,
            state: Mutex::new(Inner { order, used_bytes }),
            in_flight: Mutex::new(HashMap::new()),
        };
        cache.evict_to_capacity().await?;
        Ok(cache)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Fetches the index bytes for `key`, going to `s3` (via a GET of
    /// `index_object_key`) only on a cache miss. Concurrent lookups for the
    /// same key collapse onto one S3 GET; a failed fetch does not poison
    /// the slot.
    pub async fn get_or_fetch(&self, key: &str, s3: &S3Capability, index_object_key: &str) -> Result<bytes::Bytes> {
        self.get_or_fetch_with(key, || async move {
            use tokio::io::AsyncReadExt;

            let mut reader = s3.get_object(index_object_key, None).await?;
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .await
                .map_err(|e| Error::Transient(anyhow::anyhow!("reading index object {index_object_key}: {e}")))?;
            Ok(bytes::Bytes::from(buf))
        })
        .await
    }

    /// The single-flight-guarded core of `get_or_fetch`, parameterized over
    /// the actual fetch so it's exercisable without a live S3 capability.
    async fn get_or_fetch_with<F, Fut>(&self, key: &str, fetch: F) -> Result<bytes::Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<bytes::Bytes>>,
    {
        if let Some(bytes) = self.read_if_present(key).await? {
            return Ok(bytes);
        }

        let guard = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.entry(key.to_owned()).or_insert_with(|| InFlight { guard: Arc::new(Mutex::new(())) }).guard.clone()
        };

        let _permit = guard.lock().await;

        // Re-check: another caller may have just finished the fetch while
        // we waited for the guard.
        if let Some(bytes) = self.read_if_present(key).await? {
            self.in_flight.lock().await.remove(key);
            return Ok(bytes);
        }

        let fetch_result = match fetch().await {
            Ok(bytes) => self.insert(key, &bytes).await.map(|_| bytes),
            Err(e) => Err(e),
        };
        self.in_flight.lock().await.remove(key);
        fetch_result
    }

    async fn read_if_present(&self, key: &str) -> Result<Option<bytes::Bytes>> {
        let hit = {
            let mut state = self.state.lock().await;
            state.order.get(key).copied()
        };
        let Some(_) = hit else { return Ok(None) };

        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes::Bytes::from(bytes))),
            Err(_) => {
                // File vanished out from under us (e.g. manual cleanup):
                // drop the stale order entry and treat as a miss.
                let mut state = self.state.lock().await;
                if let Some(size) = state.order.pop(key) {
                    state.used_bytes = state.used_bytes.saturating_sub(size);
                }
                Ok(None)
            }
        }
    }

    async fn insert(&self, key: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::write(self.path_for(key), bytes)
            .await
            .map_err(|e| Error::Fatal(anyhow::anyhow!("writing cache entry {key}: {e}")))?;

        {
            let mut state = self.state.lock().await;
            if let Some(old_size) = state.order.put(key.to_owned(), bytes.len() as u64) {
                state.used_bytes = state.used_bytes.saturating_sub(old_size);
            }
            state.used_bytes += bytes.len() as u64;
        }
        self.evict_to_capacity().await
    }

    async fn evict_to_capacity(&self) -> Result<()> {
        loop {
            let victim = {
                let mut state = self.state.lock().await;
                if state.used_bytes <= self.capacity_bytes {
                    None
                } else {
                    state.order.pop_lru().map(|(k, size)| {
                        state.used_bytes = state.used_bytes.saturating_sub(size);
                        k
                    })
                }
            };
            match victim {
                None => return Ok(()),
                Some(key) => {
                    let _ = tokio::fs::remove_file(self.path_for(&key)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cache_key_is_stable_and_distinguishes_tuples() {
        let a = cache_key("set", 0, 999, 1);
        let b = cache_key("set", 0, 999, 1);
        let c = cache_key("set", 0, 999, 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn evicts_lru_entries_past_capacity() {
        let dir = tempfile::tempdir().unwrap();
        // Capacity fits 3 of these 4-byte entries.
        let cache = IndexCache::open(dir.path().to_owned(), 12).await.unwrap();
        for k in ["k1", "k2", "k3", "k4"] {
            cache.insert(k, b"aaaa").await.unwrap();
        }
        let state = cache.state.lock().await;
        assert_eq!(state.order.len(), 3);
        assert!(!state.order.contains("k1"));
        assert!(state.order.contains("k4"));
    }

    #[tokio::test]
    async fn restores_lru_order_from_mtimes_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = IndexCache::open(dir.path().to_owned(), 1024).await.unwrap();
            cache.insert("only", b"data").await.unwrap();
        }
        let reopened = IndexCache::open(dir.path().to_owned(), 1024).await.unwrap();
        let bytes = reopened.read_if_present("only").await.unwrap();
        assert_eq!(bytes.unwrap().as_ref(), b"data");
    }

    #[tokio::test]
    async fn single_flight_collapses_concurrent_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(IndexCache::open(dir.path().to_owned(), 1024).await.unwrap());
        let calls = Arc::new(AtomicUsize::new(0));

        // No live S3Capability in a unit test, so `get_or_fetch_with` is
        // driven directly with a fake fetch that counts its own
        // invocations. A short sleep widens the race window so the 8
        // tasks actually overlap on the same key instead of serializing
        // through sheer scheduling luck.
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch_with("k", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(bytes::Bytes::from_static(b"value"))
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "single-flight should collapse all 8 misses into one fetch");
        let bytes = cache.read_if_present("k").await.unwrap();
        assert_eq!(bytes.unwrap().as_ref(), b"value");
    }
}
