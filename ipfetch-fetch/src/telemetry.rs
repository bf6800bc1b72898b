//! Tracing subscriber bootstrap
//!
//! Library code only emits `tracing` events; binaries call [`init_tracing`]
//! once at startup to decide where they go.

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
    /// Directive applied when `RUST_LOG` is not set.
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: false,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Defaults overridden by `IPFETCH_LOG_JSON` (`true`/`1`) and
    /// `IPFETCH_LOG_FILTER`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(json) = lookup("IPFETCH_LOG_JSON") {
            config.json = json == "true" || json == "1";
        }
        if let Some(filter) = lookup("IPFETCH_LOG_FILTER") {
            if !filter.trim().is_empty() {
                config.default_filter = filter;
            }
        }
        config
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.default_filter))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let registry = tracing_subscriber::registry().with(config.env_filter());

    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    result.map_err(|e| TelemetryError::Init(e.to_string()))?;

    tracing::debug!(json = config.json, filter = %config.default_filter, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = TelemetryConfig::from_lookup(lookup(&[]));
        assert_eq!(config, TelemetryConfig::default());
        assert!(!config.json);
        assert_eq!(config.default_filter, "info");
    }

    #[test]
    fn test_env_overrides() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            ("IPFETCH_LOG_JSON", "1"),
            ("IPFETCH_LOG_FILTER", "ipfetch_fetch=debug"),
        ]));
        assert!(config.json);
        assert_eq!(config.default_filter, "ipfetch_fetch=debug");
    }

    #[test]
    fn test_blank_filter_is_ignored() {
        let config = TelemetryConfig::from_lookup(lookup(&[("IPFETCH_LOG_FILTER", "  ")]));
        assert_eq!(config.default_filter, DEFAULT_FILTER);
    }

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig::default();
        // Another test binary thread may have won the first install; either
        // way a second call must fail.
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
