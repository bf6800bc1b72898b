//! Grouping of distinct keys into one multi-key lookup.
//!
//! Keys queued within `batch_delay` of the first unflushed key (or until
//! `max_batch_size` keys are queued) are handed to a [`BatchLoader`] in a
//! single call, and each caller receives the value for its own key.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ipfetch_core::BatchError;
use tokio::sync::oneshot;

/// A backend able to resolve many keys in one call.
#[async_trait]
pub trait BatchLoader<K, V>: Send + Sync {
    /// Resolve `keys`. Keys absent from the returned map are reported to
    /// their callers as [`BatchError::ResultMissingForKey`]; an `Err` is
    /// delivered to every caller in the batch.
    async fn load(&self, keys: Vec<K>) -> Result<HashMap<K, V>, BatchError>;
}

type Waiter<K, V> = (K, oneshot::Sender<Result<V, BatchError>>);

struct Pending<K, V> {
    items: Vec<Waiter<K, V>>,
    /// Bumped on every flush so a stale timer knows its batch is gone.
    generation: u64,
}

impl<K, V> Pending<K, V> {
    fn take(&mut self) -> Vec<Waiter<K, V>> {
        self.generation = self.generation.wrapping_add(1);
        std::mem::take(&mut self.items)
    }
}

/// Collects keys and flushes them to a [`BatchLoader`].
pub struct RequestBatcher<K, V> {
    loader: Arc<dyn BatchLoader<K, V>>,
    pending: Arc<Mutex<Pending<K, V>>>,
    max_batch_size: usize,
    batch_delay: Duration,
}

impl<K, V> Clone for RequestBatcher<K, V> {
    fn clone(&self) -> Self {
        Self {
            loader: Arc::clone(&self.loader),
            pending: Arc::clone(&self.pending),
            max_batch_size: self.max_batch_size,
            batch_delay: self.batch_delay,
        }
    }
}

impl<K, V> RequestBatcher<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(
        loader: Arc<dyn BatchLoader<K, V>>,
        max_batch_size: usize,
        batch_delay: Duration,
    ) -> Self {
        Self {
            loader,
            pending: Arc::new(Mutex::new(Pending {
                items: Vec::new(),
                generation: 0,
            })),
            max_batch_size: max_batch_size.max(1),
            batch_delay,
        }
    }

    /// Queue `key` and wait for its value.
    ///
    /// Must be called from within a tokio runtime; flushes run on spawned tasks.
    pub async fn add(&self, key: K) -> Result<V, BatchError> {
        let (tx, rx) = oneshot::channel();

        let (full_batch, timer_generation) = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.items.push((key, tx));
            if pending.items.len() >= self.max_batch_size {
                (Some(pending.take()), None)
            } else if pending.items.len() == 1 {
                (None, Some(pending.generation))
            } else {
                (None, None)
            }
        };

        if let Some(batch) = full_batch {
            tracing::trace!(size = batch.len(), "Flushing full batch");
            tokio::spawn(dispatch(Arc::clone(&self.loader), batch));
        } else if let Some(generation) = timer_generation {
            self.schedule_flush(generation);
        }

        rx.await.map_err(|_| BatchError::Closed)?
    }

    /// Number of keys waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    fn schedule_flush(&self, generation: u64) {
        let pending = Arc::clone(&self.pending);
        let loader = Arc::clone(&self.loader);
        let delay = self.batch_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let batch = {
                let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
                if pending.generation == generation && !pending.items.is_empty() {
                    Some(pending.take())
                } else {
                    None
                }
            };
            if let Some(batch) = batch {
                tracing::trace!(size = batch.len(), "Flushing batch after delay");
                dispatch(loader, batch).await;
            }
        });
    }
}

async fn dispatch<K, V>(loader: Arc<dyn BatchLoader<K, V>>, batch: Vec<Waiter<K, V>>)
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    // One lookup per distinct key; duplicate callers share the value.
    let mut seen = HashSet::with_capacity(batch.len());
    let keys: Vec<K> = batch
        .iter()
        .filter(|(key, _)| seen.insert(key.clone()))
        .map(|(key, _)| key.clone())
        .collect();

    match loader.load(keys).await {
        Ok(values) => {
            for (key, tx) in batch {
                let result = values
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| BatchError::ResultMissingForKey {
                        key: key.to_string(),
                    });
                // The caller may have gone away; nothing to do then.
                let _ = tx.send(result);
            }
        }
        Err(e) => {
            tracing::warn!(size = batch.len(), error = %e, "Grouped lookup failed");
            for (_, tx) in batch {
                let _ = tx.send(Err(e.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;

    /// Doubles numeric keys, omits `missing`, fails whole batches containing `fail`.
    #[derive(Default)]
    struct RecordingLoader {
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingLoader {
        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchLoader<String, u64> for RecordingLoader {
        async fn load(&self, keys: Vec<String>) -> Result<HashMap<String, u64>, BatchError> {
            self.batches.lock().unwrap().push(keys.clone());
            if keys.iter().any(|k| k == "fail") {
                return Err(BatchError::LoadFailed {
                    reason: "backend down".to_string(),
                });
            }
            Ok(keys
                .into_iter()
                .filter_map(|k| k.parse::<u64>().ok().map(|n| (k, n * 2)))
                .collect())
        }
    }

    fn batcher(loader: &Arc<RecordingLoader>, size: usize) -> RequestBatcher<String, u64> {
        RequestBatcher::new(
            Arc::clone(loader) as Arc<dyn BatchLoader<String, u64>>,
            size,
            Duration::from_millis(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_within_delay_share_one_lookup() {
        let loader = Arc::new(RecordingLoader::default());
        let batcher = batcher(&loader, 50);

        let results = join_all(["1", "2", "3"].map(|k| batcher.add(k.to_string()))).await;

        assert_eq!(results, vec![Ok(2), Ok(4), Ok(6)]);
        assert_eq!(loader.batches(), vec![vec!["1", "2", "3"]]);
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_without_waiting() {
        let loader = Arc::new(RecordingLoader::default());
        let batcher = batcher(&loader, 2);

        let results = join_all(["1", "2", "3"].map(|k| batcher.add(k.to_string()))).await;

        assert_eq!(results, vec![Ok(2), Ok(4), Ok(6)]);
        assert_eq!(loader.batches(), vec![vec!["1", "2"], vec!["3"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_key_is_rejected_individually() {
        let loader = Arc::new(RecordingLoader::default());
        let batcher = batcher(&loader, 50);

        let results = join_all(["5", "missing"].map(|k| batcher.add(k.to_string()))).await;

        assert_eq!(results[0], Ok(10));
        assert_eq!(
            results[1],
            Err(BatchError::ResultMissingForKey {
                key: "missing".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loader_failure_rejects_whole_batch() {
        let loader = Arc::new(RecordingLoader::default());
        let batcher = batcher(&loader, 50);

        let results = join_all(["1", "fail", "2"].map(|k| batcher.add(k.to_string()))).await;

        let expected = Err(BatchError::LoadFailed {
            reason: "backend down".to_string(),
        });
        assert!(results.iter().all(|r| *r == expected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_keys_are_looked_up_once() {
        let loader = Arc::new(RecordingLoader::default());
        let batcher = batcher(&loader, 50);

        let results = join_all(["7", "7"].map(|k| batcher.add(k.to_string()))).await;

        assert_eq!(results, vec![Ok(14), Ok(14)]);
        assert_eq!(loader.batches(), vec![vec!["7"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_keys_start_a_new_batch() {
        let loader = Arc::new(RecordingLoader::default());
        let batcher = batcher(&loader, 50);

        assert_eq!(batcher.add("1".to_string()).await, Ok(2));
        assert_eq!(batcher.add("2".to_string()).await, Ok(4));
        assert_eq!(loader.batches().len(), 2);
    }
}
