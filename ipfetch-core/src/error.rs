//! Error types for ipfetch operations

use crate::ContentKind;
use std::fmt;
use thiserror::Error;

/// Content-level validation failures. Never retried for the same CID.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{kind} payload is {size} bytes, exceeding the {limit} byte limit")]
    SizeExceeded {
        kind: ContentKind,
        size: usize,
        limit: usize,
    },

    #[error("Malformed {kind} payload: {reason}")]
    MalformedPayload { kind: ContentKind, reason: String },

    #[error("Image MIME type not allowed: {mime}")]
    InvalidMimeType { mime: String },

    #[error("Malicious content detected: {pattern}")]
    MaliciousContentDetected { pattern: String },
}

impl ValidationError {
    /// Stable reason code for callers that branch on the failure class.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ValidationError::SizeExceeded { .. } => "SIZE_EXCEEDED",
            ValidationError::MalformedPayload { .. } => "MALFORMED_PAYLOAD",
            ValidationError::InvalidMimeType { .. } => "INVALID_MIME_TYPE",
            ValidationError::MaliciousContentDetected { .. } => "MALICIOUS_CONTENT_DETECTED",
        }
    }
}

/// Why a single gateway attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout { after_ms: u64 },
    HttpStatus { status: u16 },
    Transport { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout { after_ms } => write!(f, "timed out after {}ms", after_ms),
            FailureReason::HttpStatus { status } => write!(f, "HTTP status {}", status),
            FailureReason::Transport { message } => write!(f, "transport error: {}", message),
        }
    }
}

/// One failed attempt against one gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayFailure {
    pub gateway: String,
    pub reason: FailureReason,
}

impl fmt::Display for GatewayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.gateway, self.reason)
    }
}

/// Gateway resolution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("All gateways exhausted for {cid}: {}", format_failures(.failures))]
    Exhausted {
        cid: String,
        failures: Vec<GatewayFailure>,
    },

    #[error("No gateways configured")]
    NoGateways,

    #[error("Gateway fetch cancelled for {cid}")]
    Cancelled { cid: String },
}

fn format_failures(failures: &[GatewayFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Cache backend errors. The cache store never surfaces these to fetch callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache full: {needed} bytes needed, {available} available")]
    Full { needed: usize, available: usize },

    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Cache backend failure: {reason}")]
    Backend { reason: String },
}

/// Request batcher errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("Grouped lookup returned no result for key {key}")]
    ResultMissingForKey { key: String },

    #[error("Grouped lookup failed: {reason}")]
    LoadFailed { reason: String },

    #[error("Batcher dropped the request before it was resolved")]
    Closed,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },
}

/// Master error type for all ipfetch errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Invalid CID: {cid:?}")]
    InvalidCid { cid: String },

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Request for {cid} was cancelled")]
    Cancelled { cid: String },
}

impl FetchError {
    /// Transient failures a caller may retry later. Validation failures and
    /// malformed CIDs are permanent for a given CID.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Gateway(GatewayError::Exhausted { .. }) | FetchError::Cancelled { .. }
        )
    }
}

/// Result type alias for ipfetch operations.
pub type FetchResult<T> = Result<T, FetchError>;

// =============================================================================
// TESTS
// =============================================================================
