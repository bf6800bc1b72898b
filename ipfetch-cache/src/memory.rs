//! In-memory cache backend.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use ipfetch_core::CacheError;

use crate::backend::{BackendUsage, CacheBackend, CacheEntry, RetainFn};

/// Concurrent map backend with a byte capacity.
///
/// A write that would push usage past the capacity is refused with
/// [`CacheError::Full`]; nothing is evicted to make room.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: DashMap<String, CacheEntry>,
    capacity_bytes: usize,
    used_bytes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity_bytes,
            used_bytes: AtomicUsize::new(0),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, cid: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.get(cid).map(|e| e.value().clone()))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let needed = entry.size_bytes;
        let replaced = self.entries.get(&entry.cid).map(|e| e.size_bytes).unwrap_or(0);
        let used = self.used_bytes.load(Ordering::Acquire);
        let available = self
            .capacity_bytes
            .saturating_sub(used.saturating_sub(replaced));
        if needed > available {
            return Err(CacheError::Full { needed, available });
        }

        // Account before inserting so a concurrent remove never subtracts
        // bytes that were not yet added.
        self.used_bytes.fetch_add(needed, Ordering::AcqRel);
        if let Some(old) = self.entries.insert(entry.cid.clone(), entry) {
            self.used_bytes.fetch_sub(old.size_bytes, Ordering::AcqRel);
        }
        Ok(())
    }

    async fn remove(&self, cid: &str) -> Result<bool, CacheError> {
        match self.entries.remove(cid) {
            Some((_, old)) => {
                self.used_bytes.fetch_sub(old.size_bytes, Ordering::AcqRel);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_if(&self, cid: &str, matches: RetainFn<'_>) -> Result<bool, CacheError> {
        match self.entries.remove_if(cid, |_, entry| matches(entry)) {
            Some((_, old)) => {
                self.used_bytes.fetch_sub(old.size_bytes, Ordering::AcqRel);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn retain(&self, keep: RetainFn<'_>) -> Result<usize, CacheError> {
        let mut removed = 0;
        let mut freed = 0;
        self.entries.retain(|_, entry| {
            if keep(entry) {
                true
            } else {
                removed += 1;
                freed += entry.size_bytes;
                false
            }
        });
        self.used_bytes.fetch_sub(freed, Ordering::AcqRel);
        Ok(removed)
    }

    async fn usage(&self) -> Result<BackendUsage, CacheError> {
        Ok(BackendUsage {
            entries: self.entries.len(),
            bytes: self.used_bytes.load(Ordering::Acquire),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ipfetch_core::{Content, ContentKind};
    use serde_json::json;

    fn entry(cid: &str, size_bytes: usize) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            cid: cid.to_string(),
            kind: ContentKind::Json,
            payload: Content::Json(json!({"cid": cid})),
            size_bytes,
            stored_at: now,
            expires_at: now,
        }
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let backend = MemoryBackend::new(1024);
        backend.put(entry("a", 10)).await.unwrap();

        let got = backend.get("a").await.unwrap().unwrap();
        assert_eq!(got.cid, "a");
        assert_eq!(backend.usage().await.unwrap(), BackendUsage { entries: 1, bytes: 10 });

        assert!(backend.remove("a").await.unwrap());
        assert!(!backend.remove("a").await.unwrap());
        assert_eq!(backend.usage().await.unwrap(), BackendUsage::default());
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let backend = MemoryBackend::new(100);
        backend.put(entry("a", 60)).await.unwrap();

        let err = backend.put(entry("b", 50)).await.unwrap_err();
        assert_eq!(err, CacheError::Full { needed: 50, available: 40 });
        assert!(backend.get("b").await.unwrap().is_none());

        // Replacing an entry may reuse its own bytes.
        backend.put(entry("a", 100)).await.unwrap();
        assert_eq!(backend.usage().await.unwrap().bytes, 100);
    }

    #[tokio::test]
    async fn test_remove_if_checks_the_stored_entry() {
        let backend = MemoryBackend::new(1024);
        backend.put(entry("a", 10)).await.unwrap();

        assert!(!backend.remove_if("a", &|e: &CacheEntry| e.size_bytes == 99).await.unwrap());
        assert_eq!(backend.usage().await.unwrap(), BackendUsage { entries: 1, bytes: 10 });

        assert!(backend.remove_if("a", &|e: &CacheEntry| e.size_bytes == 10).await.unwrap());
        assert!(!backend.remove_if("a", &|_: &CacheEntry| true).await.unwrap());
        assert_eq!(backend.usage().await.unwrap(), BackendUsage::default());
    }

    #[tokio::test]
    async fn test_retain_frees_bytes() {
        let backend = MemoryBackend::new(1024);
        backend.put(entry("keep", 10)).await.unwrap();
        backend.put(entry("drop-1", 20)).await.unwrap();
        backend.put(entry("drop-2", 30)).await.unwrap();

        let removed = backend
            .retain(&|e: &CacheEntry| !e.cid.starts_with("drop"))
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert_eq!(backend.usage().await.unwrap(), BackendUsage { entries: 1, bytes: 10 });
    }
}
