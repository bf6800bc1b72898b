//! In-flight request coalescing.
//!
//! Concurrent callers asking for the same key share one underlying
//! operation and all observe its outcome. The entry for a key is dropped as
//! soon as the operation settles, so a later call always starts fresh. If
//! every waiter goes away first the operation is dropped with them and the
//! entry goes too.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type SharedResult<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

type Entries<K, V, E> = Arc<DashMap<K, InFlight<V, E>>>;

struct InFlight<V, E> {
    id: u64,
    registered_at: Instant,
    cancel: CancellationToken,
    /// Only the waiters keep the operation alive.
    future: Option<WeakShared<BoxFuture<'static, Result<V, E>>>>,
}

impl<V, E> InFlight<V, E> {
    fn join(&self, reuse_window: Duration) -> Option<SharedResult<V, E>> {
        if self.registered_at.elapsed() > reuse_window {
            return None;
        }
        self.future.as_ref().and_then(WeakShared::upgrade)
    }
}

/// Lives inside the shared operation and removes its entry when the
/// operation settles or is dropped.
struct Release<K: Eq + Hash, V, E> {
    entries: Entries<K, V, E>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, V, E> Drop for Release<K, V, E> {
    fn drop(&mut self) {
        // Only our own entry; a replacement may already be registered.
        self.entries
            .remove_if(&self.key, |_, in_flight| in_flight.id == self.id);
    }
}

/// Keyed coalescing of concurrent operations.
///
/// Values and errors must be `Clone` because every waiter receives its own
/// copy of the single outcome.
pub struct RequestDeduplicator<K, V, E> {
    entries: Entries<K, V, E>,
    next_id: AtomicU64,
    joined: AtomicU64,
}

impl<K, V, E> Default for RequestDeduplicator<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> RequestDeduplicator<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Run `operation` for `key`, or join the one already running.
    ///
    /// An in-flight entry older than `reuse_window` is not joined; it is
    /// replaced by a new operation (the old one still completes for its own
    /// waiters). `operation` receives the token tripped by [`Self::abort`].
    pub async fn dedupe<F, Fut>(&self, key: K, reuse_window: Duration, operation: F) -> Result<V, E>
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let future = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut existing) => match existing.get().join(reuse_window) {
                Some(future) => {
                    self.joined.fetch_add(1, Ordering::Relaxed);
                    future
                }
                None => {
                    let (in_flight, future) = self.start(key, operation);
                    existing.insert(in_flight);
                    future
                }
            },
            Entry::Vacant(vacant) => {
                let (in_flight, future) = self.start(key, operation);
                vacant.insert(in_flight);
                future
            }
        };

        future.await
    }

    fn start<F, Fut>(&self, key: K, operation: F) -> (InFlight<V, E>, SharedResult<V, E>)
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let operation = operation(cancel.clone());
        let release = Release {
            entries: Arc::clone(&self.entries),
            key,
            id,
        };

        let future = async move {
            let _release = release;
            operation.await
        }
        .boxed()
        .shared();

        let in_flight = InFlight {
            id,
            registered_at: Instant::now(),
            cancel,
            future: future.downgrade(),
        };
        (in_flight, future)
    }

    /// Stop tracking `key` without touching the running operation. Returns
    /// whether an entry was present.
    pub fn forget(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Stop tracking `key` and trip its cancellation token.
    pub fn abort(&self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some((_, in_flight)) => {
                in_flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove every entry whose key matches `pred`, tripping tokens when
    /// `abort` is set. Returns the number removed.
    pub fn remove_where<P>(&self, pred: P, abort: bool) -> usize
    where
        P: Fn(&K) -> bool,
    {
        let mut removed = 0;
        self.entries.retain(|key, in_flight| {
            if !pred(key) {
                return true;
            }
            if abort {
                in_flight.cancel.cancel();
            }
            removed += 1;
            false
        });
        removed
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    /// Number of calls that joined an existing operation instead of starting one.
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }
}

impl<K, V, E> std::fmt::Debug for RequestDeduplicator<K, V, E>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDeduplicator")
            .field("in_flight", &self.entries.len())
            .field("joined", &self.joined.load(Ordering::Relaxed))
            .finish()
    }
}
