//! Gateway fallback.
//!
//! A fetch walks the endpoints in priority order. Transport errors, non-2xx
//! statuses and per-attempt timeouts move on to the next endpoint; the call
//! only fails once every endpoint in every retry round has failed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipfetch_core::{
    BreakerPolicy, FailureReason, FetchConfig, GatewayError, GatewayFailure, RawPayload,
    RetryPolicy,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::transport::{GatewayEndpoint, GatewayTransport};

#[derive(Debug)]
struct GatewaySlot {
    endpoint: GatewayEndpoint,
    breaker: CircuitBreaker,
    successes: AtomicU64,
    failures: AtomicU64,
    deferred: AtomicU64,
}

/// Counters for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStats {
    pub base_url: String,
    pub priority: usize,
    pub successes: u64,
    pub failures: u64,
    /// Rounds in which the endpoint was moved to the back because its circuit was open.
    pub deferred: u64,
    pub circuit: CircuitState,
}

/// Per-endpoint counters, in priority order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GatewayStats {
    pub per_endpoint: Vec<EndpointStats>,
}

impl GatewayStats {
    pub fn endpoint(&self, base_url: &str) -> Option<&EndpointStats> {
        self.per_endpoint.iter().find(|e| e.base_url == base_url)
    }

    pub fn total_successes(&self) -> u64 {
        self.per_endpoint.iter().map(|e| e.successes).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.per_endpoint.iter().map(|e| e.failures).sum()
    }
}

enum AttemptError {
    Failed(FailureReason),
    Cancelled,
}

/// Resolves a CID to raw bytes through an ordered list of gateways.
#[derive(Debug, Clone)]
pub struct GatewayResolver {
    slots: Arc<Vec<GatewaySlot>>,
    transport: Arc<dyn GatewayTransport>,
    attempt_timeout: Duration,
    retry: RetryPolicy,
}

impl GatewayResolver {
    pub fn new(
        endpoints: Vec<GatewayEndpoint>,
        transport: Arc<dyn GatewayTransport>,
        attempt_timeout: Duration,
        retry: RetryPolicy,
        breaker: &BreakerPolicy,
    ) -> Self {
        let mut endpoints = endpoints;
        endpoints.sort_by_key(|e| e.priority);
        let slots = endpoints
            .into_iter()
            .map(|endpoint| GatewaySlot {
                endpoint,
                breaker: CircuitBreaker::new(breaker),
                successes: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                deferred: AtomicU64::new(0),
            })
            .collect();

        Self {
            slots: Arc::new(slots),
            transport,
            attempt_timeout,
            retry,
        }
    }

    pub fn from_config(config: &FetchConfig, transport: Arc<dyn GatewayTransport>) -> Self {
        Self::new(
            GatewayEndpoint::from_urls(config.gateways.iter().cloned()),
            transport,
            config.request_timeout(),
            config.retry.clone(),
            &config.circuit_breaker,
        )
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &GatewayEndpoint> {
        self.slots.iter().map(|s| &s.endpoint)
    }

    /// Fetch `cid` from the first gateway that answers successfully.
    ///
    /// Endpoints whose circuit is open are tried last in each round, so every
    /// endpoint is attempted before the call fails. Returns
    /// [`GatewayError::Exhausted`] listing every failed
    /// attempt, or [`GatewayError::Cancelled`] as soon as `cancel` fires.
    pub async fn fetch_with_fallback(
        &self,
        cid: &str,
        cancel: &CancellationToken,
    ) -> Result<RawPayload, GatewayError> {
        if self.slots.is_empty() {
            return Err(GatewayError::NoGateways);
        }

        let rounds = self.retry.rounds.max(1);
        let mut failures = Vec::new();

        for round in 0..rounds {
            let backoff = self.retry.backoff_before(round);
            if !backoff.is_zero() {
                tracing::debug!(cid = %cid, round, backoff_ms = backoff.as_millis() as u64, "Backing off before retry round");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(cancelled(cid)),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            // Endpoints with an open circuit go to the back of the round
            // rather than out of it.
            let mut open = Vec::new();
            for slot in self.slots.iter() {
                if !slot.breaker.is_allowed() {
                    slot.deferred.fetch_add(1, Ordering::Relaxed);
                    open.push(slot);
                    continue;
                }
                if let Some(payload) = self.try_slot(slot, cid, round, cancel, &mut failures).await? {
                    return Ok(payload);
                }
            }

            if !open.is_empty() {
                tracing::debug!(cid = %cid, round, open = open.len(), "Trying gateways with open circuits last");
            }
            for slot in open {
                if let Some(payload) = self.try_slot(slot, cid, round, cancel, &mut failures).await? {
                    return Ok(payload);
                }
            }
        }

        Err(GatewayError::Exhausted {
            cid: cid.to_string(),
            failures,
        })
    }

    /// One attempt against `slot`, with its outcome recorded. `Ok(None)`
    /// means the endpoint failed and the round moves on.
    async fn try_slot(
        &self,
        slot: &GatewaySlot,
        cid: &str,
        round: u32,
        cancel: &CancellationToken,
        failures: &mut Vec<GatewayFailure>,
    ) -> Result<Option<RawPayload>, GatewayError> {
        if cancel.is_cancelled() {
            slot.breaker.release_probe();
            return Err(cancelled(cid));
        }

        let gateway = &slot.endpoint.base_url;
        match self.attempt(slot, cid, cancel).await {
            Ok(payload) => {
                slot.successes.fetch_add(1, Ordering::Relaxed);
                slot.breaker.record_success();
                tracing::debug!(cid = %cid, gateway = %gateway, bytes = payload.len(), "Gateway fetch succeeded");
                Ok(Some(payload))
            }
            Err(AttemptError::Cancelled) => {
                slot.breaker.release_probe();
                Err(cancelled(cid))
            }
            Err(AttemptError::Failed(reason)) => {
                slot.failures.fetch_add(1, Ordering::Relaxed);
                slot.breaker.record_failure();
                tracing::warn!(cid = %cid, gateway = %gateway, round, error = %reason, "Gateway attempt failed");
                failures.push(GatewayFailure {
                    gateway: gateway.clone(),
                    reason,
                });
                Ok(None)
            }
        }
    }

    async fn attempt(
        &self,
        slot: &GatewaySlot,
        cid: &str,
        cancel: &CancellationToken,
    ) -> Result<RawPayload, AttemptError> {
        let request = tokio::time::timeout(
            self.attempt_timeout,
            self.transport.fetch(&slot.endpoint, cid),
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AttemptError::Cancelled),
            result = request => match result {
                Err(_) => Err(AttemptError::Failed(FailureReason::Timeout {
                    after_ms: self.attempt_timeout.as_millis() as u64,
                })),
                Ok(Err(reason)) => Err(AttemptError::Failed(reason)),
                Ok(Ok(payload)) => Ok(if payload.source.is_some() {
                    payload
                } else {
                    payload.with_source(slot.endpoint.base_url.clone())
                }),
            },
        }
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            per_endpoint: self
                .slots
                .iter()
                .map(|s| EndpointStats {
                    base_url: s.endpoint.base_url.clone(),
                    priority: s.endpoint.priority,
                    successes: s.successes.load(Ordering::Relaxed),
                    failures: s.failures.load(Ordering::Relaxed),
                    deferred: s.deferred.load(Ordering::Relaxed),
                    circuit: s.breaker.state(),
                })
                .collect(),
        }
    }
}

fn cancelled(cid: &str) -> GatewayError {
    GatewayError::Cancelled {
        cid: cid.to_string(),
    }
}
