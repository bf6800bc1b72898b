//! TTL cache store.
//!
//! Lookups treat an entry whose `expires_at` has passed as absent and drop it
//! on the spot; there is no background sweep. Writes never fail the caller:
//! a refused or failed write is logged, counted and otherwise ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipfetch_core::time::to_chrono;
use ipfetch_core::{Clock, Content, SystemClock};
use serde::Serialize;

use crate::backend::{CacheBackend, CacheEntry};
use crate::memory::MemoryBackend;

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of entries currently stored (may include not yet evicted expired ones).
    pub count: usize,
    /// Approximate memory usage in bytes.
    pub approx_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped on lookup because their TTL had passed.
    pub expired: u64,
    /// `set` calls that degraded to a no-op.
    pub write_failures: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    write_failures: AtomicU64,
}

/// CID-keyed cache of validated content with per-entry TTL.
#[derive(Debug, Clone)]
pub struct TtlCache {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
}

impl TtlCache {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            counters: Arc::new(Counters::default()),
        }
    }

    /// In-memory cache with the given byte capacity and the system clock.
    pub fn in_memory(capacity_bytes: usize) -> Self {
        Self::new(
            Arc::new(MemoryBackend::new(capacity_bytes)),
            Arc::new(SystemClock),
        )
    }

    /// Look up a live entry for `cid`.
    pub async fn get(&self, cid: &str) -> Option<CacheEntry> {
        let entry = match self.backend.get(cid).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(cid = %cid, error = %e, "Cache read failed; treating as miss");
                None
            }
        };

        let Some(entry) = entry else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let now = self.clock.now();
        if entry.is_expired_at(now) {
            // A fresh entry may have been stored since the read; leave it.
            let still_expired = move |stored: &CacheEntry| stored.is_expired_at(now);
            if let Err(e) = self.backend.remove_if(cid, &still_expired).await {
                tracing::warn!(cid = %cid, error = %e, "Failed to drop expired cache entry");
            }
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(cid = %cid, expires_at = %entry.expires_at, "Cache entry expired");
            return None;
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Store `payload` for `cid` for `ttl`. Never fails; a backend error only
    /// means nothing was cached.
    pub async fn set(&self, cid: &str, payload: Content, ttl: Duration) {
        let stored_at = self.clock.now();
        let expires_at = stored_at
            .checked_add_signed(to_chrono(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = CacheEntry {
            cid: cid.to_string(),
            kind: payload.kind(),
            size_bytes: payload.approx_size(),
            payload,
            stored_at,
            expires_at,
        };
        let size_bytes = entry.size_bytes;

        match self.backend.put(entry).await {
            Ok(()) => {
                tracing::trace!(cid = %cid, size_bytes, ttl_ms = ttl.as_millis() as u64, "Cached content");
            }
            Err(e) => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(cid = %cid, size_bytes, error = %e, "Cache write failed; continuing uncached");
            }
        }
    }

    pub async fn invalidate(&self, cid: &str) {
        if let Err(e) = self.backend.remove(cid).await {
            tracing::warn!(cid = %cid, error = %e, "Cache invalidation failed");
        }
    }

    /// Evict entries.
    ///
    /// With `older_than = None` every entry is removed. Otherwise entries
    /// stored at least `older_than` ago are removed, together with any entry
    /// that has already expired. Returns the number of entries removed.
    pub async fn clear(&self, older_than: Option<Duration>) -> usize {
        let now = self.clock.now();
        let result = match older_than {
            None => self.backend.retain(&|_: &CacheEntry| false).await,
            Some(age) => {
                let cutoff = now
                    .checked_sub_signed(to_chrono(age))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                self.backend
                    .retain(&|e: &CacheEntry| e.stored_at > cutoff && !e.is_expired_at(now))
                    .await
            }
        };

        match result {
            Ok(removed) => {
                tracing::debug!(removed, "Cleared cache entries");
                removed
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cache clear failed");
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let usage = self.backend.usage().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Cache usage unavailable");
            Default::default()
        });
        CacheStats {
            count: usage.entries,
            approx_size_bytes: usage.bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
        }
    }
}
