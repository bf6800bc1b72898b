//! ipfetch Core - Shared Types
//!
//! CID syntax checks, content kinds and limits, the content validator,
//! configuration, error types and the clock abstraction. Every other ipfetch
//! crate depends on this one; it performs no I/O beyond reading a config file.

pub mod cid;
pub mod config;
pub mod content;
pub mod error;
pub mod kind;
pub mod time;
pub mod validate;

pub use cid::{embedded_cid, is_valid_cid, Cid, CidVersion};
pub use config::{BreakerPolicy, CancellationMode, FetchConfig, RetryPolicy, DEFAULT_GATEWAYS};
pub use content::{Content, ImageData, ImageMime, RawPayload, ValidatedContent};
pub use error::{
    BatchError, CacheError, ConfigError, FailureReason, FetchError, FetchResult, GatewayError,
    GatewayFailure, ValidationError,
};
pub use kind::{ContentKind, KindLimits, ValidationLimits};
pub use time::{Clock, ManualClock, SystemClock};
pub use validate::ContentValidator;

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
