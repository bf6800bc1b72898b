//! ipfetch Gateway - Fallback Across Public Gateways
//!
//! Deals in raw bytes only; content kinds and validation live elsewhere.

pub mod breaker;
pub mod resolver;
pub mod transport;

pub use breaker::{CircuitBreaker, CircuitState};
pub use resolver::{EndpointStats, GatewayResolver, GatewayStats};
pub use transport::{GatewayEndpoint, GatewayTransport, HttpTransport};

// Re-exported so callers can build tokens without a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
