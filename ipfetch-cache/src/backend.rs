//! Cache backend trait and entry type.
//!
//! Backends are plain key-value stores keyed by CID. Expiry is decided by
//! [`crate::TtlCache`]; a backend only stores what it is given and reports
//! its usage.

use async_trait::async_trait;
use ipfetch_core::{CacheError, Content, ContentKind, Timestamp};

/// A validated payload together with its lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub cid: String,
    pub kind: ContentKind,
    pub payload: Content,
    /// Approximate footprint used for capacity accounting.
    pub size_bytes: usize,
    pub stored_at: Timestamp,
    pub expires_at: Timestamp,
}

impl CacheEntry {
    /// Whether the entry is expired at `now`. An entry is still live at
    /// exactly `expires_at`.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }
}

/// Current occupancy of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendUsage {
    pub entries: usize,
    pub bytes: usize,
}

/// Predicate used by [`CacheBackend::retain`].
pub type RetainFn<'a> = &'a (dyn Fn(&CacheEntry) -> bool + Send + Sync);

/// Pluggable storage behind the TTL cache.
///
/// Implementations must be safe for concurrent use; the fetcher calls them
/// from many tasks at once without external locking.
#[async_trait]
pub trait CacheBackend: Send + Sync + std::fmt::Debug {
    async fn get(&self, cid: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Store `entry`, replacing any entry for the same CID.
    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Remove the entry for `cid`. Returns whether one was present.
    async fn remove(&self, cid: &str) -> Result<bool, CacheError>;

    /// Remove the entry for `cid` only if `matches` holds for the entry stored
    /// at the time of removal. The check and the removal must be atomic with
    /// respect to `put`. Returns whether an entry was removed.
    async fn remove_if(&self, cid: &str, matches: RetainFn<'_>) -> Result<bool, CacheError>;

    /// Keep only entries for which `keep` returns true. Returns the number removed.
    async fn retain(&self, keep: RetainFn<'_>) -> Result<usize, CacheError>;

    async fn usage(&self) -> Result<BackendUsage, CacheError>;
}
