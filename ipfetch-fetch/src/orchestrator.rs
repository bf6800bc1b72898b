//! The public retrieval API.
//!
//! A single fetch runs: CID check, cache lookup, dedupe gate, gateway fetch,
//! validation, caching. Only content that passed validation for the requested
//! kind is ever returned or cached.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use ipfetch_cache::{CacheBackend, CacheStats, MemoryBackend, TtlCache};
use ipfetch_core::{
    is_valid_cid, CancellationMode, Clock, Content, ContentKind, ContentValidator, FetchConfig,
    FetchError, FetchResult, GatewayError, SystemClock,
};
use ipfetch_gateway::{
    CancellationToken, GatewayResolver, GatewayStats, GatewayTransport, HttpTransport,
};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::dedup::RequestDeduplicator;

/// Dedupe key: the same CID requested as two kinds is two requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub cid: String,
    pub kind: ContentKind,
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.cid, self.kind)
    }
}

/// Per-call options for [`ContentFetcher::fetch_content`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Bypass the cache lookup. The result is still cached.
    pub skip_cache: bool,
    /// TTL for the cached result instead of the configured default.
    pub custom_ttl: Option<Duration>,
}

/// One entry of a multi-CID fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchItem {
    pub cid: String,
    pub kind: ContentKind,
}

impl FetchItem {
    pub fn new(cid: impl Into<String>, kind: ContentKind) -> Self {
        Self {
            cid: cid.into(),
            kind,
        }
    }
}

/// Progress callback: `(percent, completed, total)`.
pub type ProgressFn = Box<dyn Fn(f64, usize, usize) + Send + Sync>;

/// Options for [`ContentFetcher::fetch_multiple`].
#[derive(Default)]
pub struct MultiFetchOptions {
    /// Batch width; defaults to the configured `max_concurrent`.
    pub max_concurrent: Option<usize>,
    /// Called after each item settles, successful or not.
    pub on_progress: Option<ProgressFn>,
    pub fetch: FetchOptions,
}

impl MultiFetchOptions {
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = Some(n);
        self
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(f64, usize, usize) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn fetch_options(mut self, fetch: FetchOptions) -> Self {
        self.fetch = fetch;
        self
    }
}

impl fmt::Debug for MultiFetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiFetchOptions")
            .field("max_concurrent", &self.max_concurrent)
            .field("on_progress", &self.on_progress.is_some())
            .field("fetch", &self.fetch)
            .finish()
    }
}

/// Result of a multi-CID fetch. Maps are keyed by CID, and the counts always
/// equal the map sizes.
#[derive(Debug, Clone, Default)]
pub struct MultiFetchOutcome {
    pub results: HashMap<String, Content>,
    pub errors: HashMap<String, FetchError>,
    pub success_count: usize,
    pub error_count: usize,
}

/// Aggregated statistics.
#[derive(Debug, Clone, Serialize)]
pub struct FetcherStats {
    pub in_flight: usize,
    /// Calls that joined an in-flight request instead of starting one.
    pub deduplicated: u64,
    pub cache: CacheStats,
    pub gateways: GatewayStats,
}

struct FetcherInner {
    config: FetchConfig,
    cache: TtlCache,
    resolver: GatewayResolver,
    validator: ContentValidator,
    in_flight: RequestDeduplicator<RequestKey, Content, FetchError>,
}

/// Fetch orchestrator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ContentFetcher {
    inner: Arc<FetcherInner>,
}

impl ContentFetcher {
    /// Fetcher with the default HTTP transport, in-memory cache and system clock.
    pub fn new(config: FetchConfig) -> FetchResult<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> ContentFetcherBuilder {
        ContentFetcherBuilder::default()
    }

    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    /// Fetch `cid` as `kind` with default options.
    pub async fn fetch(&self, cid: &str, kind: ContentKind) -> FetchResult<Content> {
        self.fetch_content(cid, kind, FetchOptions::default()).await
    }

    /// Fetch, validate and cache one CID.
    ///
    /// Callers joining a request already in flight share its outcome and
    /// the options of the call that started it.
    pub async fn fetch_content(
        &self,
        cid: &str,
        kind: ContentKind,
        opts: FetchOptions,
    ) -> FetchResult<Content> {
        if !is_valid_cid(cid) {
            tracing::debug!(cid = %cid, "Rejected invalid CID");
            return Err(FetchError::InvalidCid {
                cid: cid.to_string(),
            });
        }

        if !opts.skip_cache {
            if let Some(entry) = self.inner.cache.get(cid).await {
                if entry.kind == kind {
                    tracing::debug!(cid = %cid, kind = %kind, "Cache hit");
                    return Ok(entry.payload);
                }
                tracing::debug!(cid = %cid, cached = %entry.kind, requested = %kind, "Cached under another kind");
            }
        }

        let key = RequestKey {
            cid: cid.to_string(),
            kind,
        };
        let ttl = opts.custom_ttl.unwrap_or_else(|| self.inner.config.default_ttl());
        let this = self.clone();
        let owned_cid = cid.to_string();

        self.inner
            .in_flight
            .dedupe(key, self.inner.config.dedupe_window(), move |cancel| async move {
                this.fetch_validate_store(owned_cid, kind, ttl, cancel).await
            })
            .await
    }

    async fn fetch_validate_store(
        &self,
        cid: String,
        kind: ContentKind,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> FetchResult<Content> {
        tracing::debug!(cid = %cid, kind = %kind, "Fetching from gateways");

        let raw = self
            .inner
            .resolver
            .fetch_with_fallback(&cid, &cancel)
            .await
            .map_err(|e| match e {
                GatewayError::Cancelled { cid } => FetchError::Cancelled { cid },
                other => FetchError::Gateway(other),
            })?;

        let validated = self.inner.validator.validate(&raw, kind).map_err(|e| {
            tracing::warn!(
                cid = %cid,
                kind = %kind,
                gateway = raw.source.as_deref().unwrap_or("unknown"),
                reason = e.reason_code(),
                error = %e,
                "Content failed validation"
            );
            FetchError::Validation(e)
        })?;

        for warning in &validated.warnings {
            tracing::warn!(cid = %cid, kind = %kind, warning = %warning, "Content validation warning");
        }

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled { cid });
        }

        self.inner
            .cache
            .set(&cid, validated.content.clone(), ttl)
            .await;
        Ok(validated.content)
    }

    /// Fetch many CIDs in batches of `max_concurrent`.
    ///
    /// Batch N+1 starts only after every item of batch N settled. Per-item
    /// failures land in `errors` and never abort the remaining items.
    ///
    /// A CID listed more than once is fetched once, as the kind of its first
    /// entry; progress counts distinct CIDs.
    pub async fn fetch_multiple(
        &self,
        items: &[FetchItem],
        opts: MultiFetchOptions,
    ) -> MultiFetchOutcome {
        let mut seen = HashSet::new();
        let items: Vec<&FetchItem> = items
            .iter()
            .filter(|item| {
                let first = seen.insert(item.cid.as_str());
                if !first {
                    tracing::debug!(cid = %item.cid, kind = %item.kind, "Dropping repeated CID from multi-fetch");
                }
                first
            })
            .collect();
        let total = items.len();
        let width = opts
            .max_concurrent
            .unwrap_or(self.inner.config.max_concurrent)
            .max(1);
        let fetch_opts = opts.fetch;
        let mut outcome = MultiFetchOutcome::default();
        let mut completed = 0;

        for chunk in items.chunks(width) {
            let mut pending: FuturesUnordered<_> = chunk
                .iter()
                .map(|&item| async move {
                    let result = self.fetch_content(&item.cid, item.kind, fetch_opts).await;
                    (item, result)
                })
                .collect();

            while let Some((item, result)) = pending.next().await {
                completed += 1;
                match result {
                    Ok(content) => {
                        outcome.success_count += 1;
                        outcome.results.insert(item.cid.clone(), content);
                    }
                    Err(e) => {
                        tracing::debug!(cid = %item.cid, error = %e, "Batch item failed");
                        outcome.error_count += 1;
                        outcome.errors.insert(item.cid.clone(), e);
                    }
                }
                if let Some(on_progress) = &opts.on_progress {
                    let percent = completed as f64 * 100.0 / total as f64;
                    on_progress(percent, completed, total);
                }
            }
        }

        tracing::debug!(
            total,
            succeeded = outcome.success_count,
            failed = outcome.error_count,
            "Multi-fetch complete"
        );
        outcome
    }

    /// Warm the cache for `cid` in the background. Errors are logged only.
    ///
    /// Returns the background task, or `None` when called outside a tokio
    /// runtime (in which case nothing is fetched).
    pub fn prefetch(&self, cid: &str, kind: ContentKind) -> Option<JoinHandle<()>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!(cid = %cid, "Prefetch skipped: no async runtime");
                return None;
            }
        };

        let this = self.clone();
        let cid = cid.to_string();
        Some(handle.spawn(async move {
            match this.fetch(&cid, kind).await {
                Ok(_) => tracing::debug!(cid = %cid, kind = %kind, "Prefetched"),
                Err(e) => tracing::debug!(cid = %cid, kind = %kind, error = %e, "Prefetch failed"),
            }
        }))
    }

    /// Stop tracking in-flight requests for `cid` (every kind).
    ///
    /// In advisory mode the network request keeps running and its current
    /// waiters still receive its outcome; only new calls start fresh. In
    /// abort mode the request is abandoned and its waiters receive
    /// [`FetchError::Cancelled`]. Returns the number of requests affected.
    pub fn cancel_request(&self, cid: &str) -> usize {
        let removed = self
            .inner
            .in_flight
            .remove_where(|key| key.cid == cid, self.aborts());
        if removed > 0 {
            tracing::debug!(cid = %cid, removed, mode = ?self.inner.config.cancellation, "Cancelled request");
        }
        removed
    }

    /// [`Self::cancel_request`] for every in-flight request.
    pub fn cancel_all_requests(&self) -> usize {
        let removed = self.inner.in_flight.remove_where(|_| true, self.aborts());
        tracing::debug!(removed, mode = ?self.inner.config.cancellation, "Cancelled all requests");
        removed
    }

    fn aborts(&self) -> bool {
        self.inner.config.cancellation == CancellationMode::Abort
    }

    pub async fn stats(&self) -> FetcherStats {
        FetcherStats {
            in_flight: self.inner.in_flight.in_flight(),
            deduplicated: self.inner.in_flight.joined(),
            cache: self.inner.cache.stats().await,
            gateways: self.inner.resolver.stats(),
        }
    }

    /// Direct access to the cache store, e.g. for explicit eviction.
    pub fn cache(&self) -> &TtlCache {
        &self.inner.cache
    }
}

impl fmt::Debug for ContentFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentFetcher")
            .field("gateways", &self.inner.config.gateways)
            .field("in_flight", &self.inner.in_flight)
            .finish()
    }
}

/// Wires a [`ContentFetcher`] from configuration and optional collaborators.
#[derive(Default)]
pub struct ContentFetcherBuilder {
    config: Option<FetchConfig>,
    transport: Option<Arc<dyn GatewayTransport>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ContentFetcherBuilder {
    pub fn config(mut self, config: FetchConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn GatewayTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and assemble the fetcher.
    pub fn build(self) -> FetchResult<ContentFetcher> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let transport: Arc<dyn GatewayTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::with_timeout(config.request_timeout())?),
        };
        let backend = self
            .cache_backend
            .unwrap_or_else(|| Arc::new(MemoryBackend::new(config.cache_max_bytes)));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let resolver = GatewayResolver::from_config(&config, transport);
        let cache = TtlCache::new(backend, clock);
        let validator = ContentValidator::new(config.limits.clone());

        tracing::debug!(
            gateways = config.gateways.len(),
            cancellation = ?config.cancellation,
            "Content fetcher ready"
        );

        Ok(ContentFetcher {
            inner: Arc::new(FetcherInner {
                config,
                cache,
                resolver,
                validator,
                in_flight: RequestDeduplicator::new(),
            }),
        })
    }
}
