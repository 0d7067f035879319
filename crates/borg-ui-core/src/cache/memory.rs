use async_trait::async_trait;
use lru::LruCache;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{BackendKind, CacheBackend};
use crate::error::Result;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Inner {
    entries: LruCache<String, Entry>,
    used_bytes: u64,
    max_bytes: u64,
}

impl Inner {
    fn remove(&mut self, key: &str) {
        if let Some(old) = self.entries.pop(key) {
            self.used_bytes -= entry_size(key, &old.value);
        }
    }

    fn evict_to_bound(&mut self) -> usize {
        let mut evicted = 0;
        while self.used_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((key, entry)) => {
                    self.used_bytes -= entry_size(&key, &entry.value);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

fn entry_size(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

/// In-process cache bounded by the byte size of keys plus values.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                used_bytes: 0,
                max_bytes,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Change the bound, evicting least-recently-used entries if needed.
    pub fn resize(&self, max_bytes: u64) {
        let mut inner = self.lock();
        inner.max_bytes = max_bytes;
        let evicted = inner.evict_to_bound();
        if evicted > 0 {
            tracing::debug!(evicted, max_bytes, "in-process cache shrunk");
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.lock().max_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().used_bytes
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.entries.get(key) {
            Some(entry) if entry.expired(now) => {}
            Some(entry) => return Ok(Some(entry.value.clone())),
            None => return Ok(None),
        }
        inner.remove(key);
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.lock();
        inner.remove(key);
        let size = entry_size(key, &value);
        if size > inner.max_bytes {
            tracing::debug!(key, size, "entry larger than in-process cache bound, not stored");
            return Ok(());
        }
        inner.used_bytes += size;
        inner.entries.put(
            key.to_string(),
            Entry {
                value,
                // a TTL past the clock's range never expires
                expires_at: ttl.and_then(|t| Instant::now().checked_add(t)),
            },
        );
        inner.evict_to_bound();
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    fn connection_info(&self) -> String {
        format!("in-process (max {} bytes)", self.max_bytes())
    }
}
