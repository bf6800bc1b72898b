//! ipfetch Fetch - Content Retrieval Orchestration
//!
//! [`ContentFetcher`] is the entry point: it validates the CID, consults the
//! cache, coalesces identical in-flight requests, falls back across gateways,
//! validates the payload for the requested kind and caches the result.
//!
//! ```no_run
//! use ipfetch_core::{ContentKind, FetchConfig};
//! use ipfetch_fetch::ContentFetcher;
//!
//! # async fn run() -> ipfetch_core::FetchResult<()> {
//! let fetcher = ContentFetcher::new(FetchConfig::from_env())?;
//! let content = fetcher
//!     .fetch("QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG", ContentKind::Metadata)
//!     .await?;
//! println!("{:?}", content.as_json());
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod dedup;
pub mod orchestrator;
pub mod telemetry;

pub use batcher::{BatchLoader, RequestBatcher};
pub use dedup::RequestDeduplicator;
pub use orchestrator::{
    ContentFetcher, ContentFetcherBuilder, FetchItem, FetchOptions, FetcherStats,
    MultiFetchOptions, MultiFetchOutcome, ProgressFn, RequestKey,
};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};
