//! Configuration types
//!
//! All values have defaults suitable for public gateways. A TOML file and
//! `IPFETCH_*` environment variables can override them; nothing is mutated
//! once a fetcher has been constructed.

use crate::error::ConfigError;
use crate::kind::ValidationLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Public gateways tried in this order when no list is configured.
pub const DEFAULT_GATEWAYS: [&str; 4] = [
    "https://ipfs.io/ipfs",
    "https://cloudflare-ipfs.com/ipfs",
    "https://gateway.pinata.cloud/ipfs",
    "https://dweb.link/ipfs",
];

/// What `cancel_request` does to a fetch that is already on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationMode {
    /// Forget the in-flight bookkeeping only; the network request runs to
    /// completion and its waiters still receive its outcome.
    #[default]
    Advisory,
    /// Also trip the request's cancellation token so the gateway resolver
    /// abandons it; waiters fail with `FetchError::Cancelled`.
    Abort,
}

/// Retry rounds across the whole gateway list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Number of full passes over the gateway list (>= 1).
    pub rounds: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rounds: 1,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait before round `round` (0-based). Round 0 never waits.
    pub fn backoff_before(&self, round: u32) -> Duration {
        if round == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(round.saturating_sub(1) as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Per-gateway circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerPolicy {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Successes in half-open state before it closes again.
    pub success_threshold: u32,
    /// How long an open breaker rejects attempts.
    pub open_timeout_ms: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 30_000,
        }
    }
}

/// Master configuration for the retrieval layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Gateway base URLs; list order is priority order.
    pub gateways: Vec<String>,
    /// Per-attempt timeout.
    pub request_timeout_ms: u64,
    /// TTL applied when a fetch does not supply one.
    pub default_ttl_ms: u64,
    /// Approximate byte capacity of the in-memory cache.
    pub cache_max_bytes: usize,
    /// Default batch width for multi-CID fetches.
    pub max_concurrent: usize,
    pub max_batch_size: usize,
    pub batch_delay_ms: u64,
    /// How long an in-flight request may be joined by identical callers.
    pub dedupe_window_ms: u64,
    pub cancellation: CancellationMode,
    pub retry: RetryPolicy,
    pub circuit_breaker: BreakerPolicy,
    pub limits: ValidationLimits,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            gateways: DEFAULT_GATEWAYS.iter().map(|g| g.to_string()).collect(),
            request_timeout_ms: 10_000,
            default_ttl_ms: 60 * 60 * 1000,
            cache_max_bytes: 50 * 1024 * 1024,
            max_concurrent: 5,
            max_batch_size: 50,
            batch_delay_ms: 10,
            dedupe_window_ms: 30_000,
            cancellation: CancellationMode::Advisory,
            retry: RetryPolicy::default(),
            circuit_breaker: BreakerPolicy::default(),
            limits: ValidationLimits::default(),
        }
    }
}

impl FetchConfig {
    /// Defaults overridden by `IPFETCH_*` environment variables.
    ///
    /// # Environment Variables
    /// - `IPFETCH_GATEWAYS`: comma-separated gateway base URLs, in priority order
    /// - `IPFETCH_REQUEST_TIMEOUT_MS`: per-attempt timeout (default: 10000)
    /// - `IPFETCH_DEFAULT_TTL_MS`: cache TTL (default: 3600000)
    /// - `IPFETCH_CACHE_MAX_BYTES`: in-memory cache capacity (default: 50 MiB)
    /// - `IPFETCH_MAX_CONCURRENT`: batch width for multi-fetch (default: 5)
    /// - `IPFETCH_MAX_BATCH_SIZE`: request batcher flush size (default: 50)
    /// - `IPFETCH_BATCH_DELAY_MS`: request batcher flush delay (default: 10)
    /// - `IPFETCH_DEDUPE_WINDOW_MS`: in-flight reuse window (default: 30000)
    /// - `IPFETCH_CANCELLATION`: `advisory` or `abort` (default: advisory)
    /// - `IPFETCH_RETRY_ROUNDS`: passes over the gateway list (default: 1)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Parse a TOML document. Missing fields keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Load a TOML file, then apply environment overrides and validate.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        tracing::debug!(
            path = %path.display(),
            gateways = config.gateways.len(),
            "Loaded fetch configuration"
        );
        Ok(config)
    }

    /// Apply `IPFETCH_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(list) = lookup("IPFETCH_GATEWAYS") {
            let gateways: Vec<String> = list
                .split(',')
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect();
            if !gateways.is_empty() {
                self.gateways = gateways;
            }
        }

        let parse_u64 = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());
        let parse_usize = |name: &str| lookup(name).and_then(|s| s.trim().parse::<usize>().ok());

        if let Some(v) = parse_u64("IPFETCH_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = v;
        }
        if let Some(v) = parse_u64("IPFETCH_DEFAULT_TTL_MS") {
            self.default_ttl_ms = v;
        }
        if let Some(v) = parse_usize("IPFETCH_CACHE_MAX_BYTES") {
            self.cache_max_bytes = v;
        }
        if let Some(v) = parse_usize("IPFETCH_MAX_CONCURRENT") {
            self.max_concurrent = v;
        }
        if let Some(v) = parse_usize("IPFETCH_MAX_BATCH_SIZE") {
            self.max_batch_size = v;
        }
        if let Some(v) = parse_u64("IPFETCH_BATCH_DELAY_MS") {
            self.batch_delay_ms = v;
        }
        if let Some(v) = parse_u64("IPFETCH_DEDUPE_WINDOW_MS") {
            self.dedupe_window_ms = v;
        }
        if let Some(v) = lookup("IPFETCH_RETRY_ROUNDS").and_then(|s| s.trim().parse::<u32>().ok()) {
            self.retry.rounds = v;
        }
        match lookup("IPFETCH_CANCELLATION")
            .map(|s| s.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("abort") => self.cancellation = CancellationMode::Abort,
            Some("advisory") => self.cancellation = CancellationMode::Advisory,
            _ => {}
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - at least one gateway, each an absolute http(s) URL
    /// - timeouts, TTL, concurrency and batch size are positive
    /// - retry rounds >= 1 and multiplier >= 1.0
    /// - breaker thresholds and every size ceiling are positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateways.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "gateways".to_string(),
            });
        }
        for gateway in &self.gateways {
            let rest = gateway
                .strip_prefix("https://")
                .or_else(|| gateway.strip_prefix("http://"));
            if rest.map(|r| r.trim_matches('/').is_empty()).unwrap_or(true) {
                return Err(invalid("gateways", gateway, "must be an absolute http(s) URL"));
            }
        }

        let positive = [
            ("request_timeout_ms", self.request_timeout_ms),
            ("default_ttl_ms", self.default_ttl_ms),
            ("max_concurrent", self.max_concurrent as u64),
            ("max_batch_size", self.max_batch_size as u64),
            ("retry.rounds", self.retry.rounds as u64),
            (
                "circuit_breaker.failure_threshold",
                self.circuit_breaker.failure_threshold as u64,
            ),
            (
                "circuit_breaker.success_threshold",
                self.circuit_breaker.success_threshold as u64,
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, &value.to_string(), "must be greater than 0"));
            }
        }

        if self.retry.multiplier < 1.0 {
            return Err(invalid(
                "retry.multiplier",
                &self.retry.multiplier.to_string(),
                "must be >= 1.0",
            ));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(invalid(
                "retry.max_backoff_ms",
                &self.retry.max_backoff_ms.to_string(),
                "must be >= initial_backoff_ms",
            ));
        }

        for kind in crate::ContentKind::ALL {
            if self.limits.for_kind(kind).max_bytes == 0 {
                return Err(invalid(
                    &format!("limits.{}.max_bytes", kind),
                    "0",
                    "must be greater than 0",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
