//! ipfetch Test Utilities
//!
//! Shared test infrastructure for the ipfetch workspace:
//! - Scripted gateway transport with call accounting
//! - A cache backend that refuses every operation
//! - Fixture CIDs, payloads and configurations
//! - Proptest generators
//! - Assertions on the error taxonomy

// Re-export core types for convenience
pub use ipfetch_core::{
    is_valid_cid, Content, ContentKind, FailureReason, FetchConfig, FetchError, GatewayError,
    ManualClock, RawPayload, ValidationError,
};
pub use ipfetch_gateway::{GatewayEndpoint, GatewayTransport};

use async_trait::async_trait;
use ipfetch_cache::{BackendUsage, CacheBackend, CacheEntry, RetainFn};
use ipfetch_core::CacheError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

// ============================================================================
// SCRIPTED TRANSPORT
// ============================================================================

/// What a scripted gateway answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    Body {
        bytes: Vec<u8>,
        content_type: Option<String>,
    },
    Status(u16),
    TransportError(String),
    /// Never answers; only a timeout or cancellation ends the attempt.
    Hang,
}

impl ScriptedResponse {
    pub fn json(value: &serde_json::Value) -> Self {
        ScriptedResponse::Body {
            bytes: value.to_string().into_bytes(),
            content_type: Some("application/json".to_string()),
        }
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>, content_type: Option<&str>) -> Self {
        ScriptedResponse::Body {
            bytes: bytes.into(),
            content_type: content_type.map(str::to_string),
        }
    }
}

/// Gateway transport answering from a script instead of the network.
///
/// Lookup order for a request to `(gateway, cid)`: an exact rule, then a
/// rule for the CID on any gateway, then a rule for the gateway, then the
/// default (404 unless changed).
#[derive(Debug)]
pub struct ScriptedTransport {
    exact: HashMap<(String, String), ScriptedResponse>,
    by_cid: HashMap<String, ScriptedResponse>,
    by_gateway: HashMap<String, ScriptedResponse>,
    default: ScriptedResponse,
    delay: Option<Duration>,
    calls: AtomicUsize,
    log: Mutex<Vec<(String, String)>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            exact: HashMap::new(),
            by_cid: HashMap::new(),
            by_gateway: HashMap::new(),
            default: ScriptedResponse::Status(404),
            delay: None,
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default(mut self, response: ScriptedResponse) -> Self {
        self.default = response;
        self
    }

    pub fn on_gateway(mut self, gateway: &str, response: ScriptedResponse) -> Self {
        self.by_gateway.insert(gateway.to_string(), response);
        self
    }

    pub fn on_cid(mut self, cid: &str, response: ScriptedResponse) -> Self {
        self.by_cid.insert(cid.to_string(), response);
        self
    }

    pub fn on(mut self, gateway: &str, cid: &str, response: ScriptedResponse) -> Self {
        self.exact
            .insert((gateway.to_string(), cid.to_string()), response);
        self
    }

    /// Sleep this long (on the tokio clock) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Total number of fetches issued.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, gateway: &str) -> usize {
        self.call_log().iter().filter(|(g, _)| g == gateway).count()
    }

    pub fn calls_for(&self, cid: &str) -> usize {
        self.call_log().iter().filter(|(_, c)| c == cid).count()
    }

    /// `(gateway, cid)` pairs in call order.
    pub fn call_log(&self) -> Vec<(String, String)> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn response_for(&self, gateway: &str, cid: &str) -> ScriptedResponse {
        self.exact
            .get(&(gateway.to_string(), cid.to_string()))
            .or_else(|| self.by_cid.get(cid))
            .or_else(|| self.by_gateway.get(gateway))
            .unwrap_or(&self.default)
            .clone()
    }
}

#[async_trait]
impl GatewayTransport for ScriptedTransport {
    async fn fetch(
        &self,
        endpoint: &GatewayEndpoint,
        cid: &str,
    ) -> Result<RawPayload, FailureReason> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((endpoint.base_url.clone(), cid.to_string()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.response_for(&endpoint.base_url, cid) {
            ScriptedResponse::Body {
                bytes,
                content_type,
            } => {
                let mut payload = RawPayload::new(bytes).with_source(endpoint.base_url.clone());
                payload.content_type = content_type;
                Ok(payload)
            }
            ScriptedResponse::Status(status) => Err(FailureReason::HttpStatus { status }),
            ScriptedResponse::TransportError(message) => {
                Err(FailureReason::Transport { message })
            }
            ScriptedResponse::Hang => std::future::pending().await,
        }
    }
}

// ============================================================================
// FAILING CACHE BACKEND
// ============================================================================

/// Cache backend whose every operation fails, for exercising degraded caching.
#[derive(Debug, Default)]
pub struct FailingBackend {
    attempts: AtomicUsize,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations attempted against the backend.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T, CacheError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Backend {
            reason: "storage unavailable".to_string(),
        })
    }
}

#[async_trait]
impl CacheBackend for FailingBackend {
    async fn get(&self, _cid: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.fail()
    }

    async fn put(&self, _entry: CacheEntry) -> Result<(), CacheError> {
        self.fail()
    }

    async fn remove(&self, _cid: &str) -> Result<bool, CacheError> {
        self.fail()
    }

    async fn remove_if(&self, _cid: &str, _matches: RetainFn<'_>) -> Result<bool, CacheError> {
        self.fail()
    }

    async fn retain(&self, _keep: RetainFn<'_>) -> Result<usize, CacheError> {
        self.fail()
    }

    async fn usage(&self) -> Result<BackendUsage, CacheError> {
        self.fail()
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built CIDs, payloads and configurations.

    use super::*;
    use serde_json::{json, Value};

    /// Well-known CIDv0.
    pub const CID_V0: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";
    /// Well-known CIDv1, base32.
    pub const CID_V1: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";
    /// CIDv1, base58btc.
    pub const CID_V1_BASE58: &str = "zdj7WWeQ43G6JJvLWQWZpyHuAMq6uYWRjkBXFad11vE2LHhQ7";

    const BASE58: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

    /// A distinct, syntactically valid CIDv0 for each `n`.
    pub fn cid(n: u64) -> String {
        let mut body = [b'1'; 44];
        let mut value = n;
        for slot in body.iter_mut().rev() {
            *slot = BASE58[(value % 58) as usize];
            value /= 58;
            if value == 0 {
                break;
            }
        }
        let body: String = body.iter().map(|b| *b as char).collect();
        format!("Qm{}", body)
    }

    pub fn metadata_json() -> Value {
        json!({
            "name": "Fixture Asset",
            "description": "A metadata document used in tests",
            "image": format!("ipfs://{}", CID_V0),
            "attributes": [{"trait_type": "rarity", "value": "common"}]
        })
    }

    pub fn profile_json() -> Value {
        json!({
            "name": "fixture",
            "bio": "test profile",
            "avatar": format!("ipfs://{}", CID_V1)
        })
    }

    /// The 8-byte PNG signature followed by a truncated IHDR chunk.
    pub fn png_bytes() -> Vec<u8> {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(&[0, 0, 0, 13, b'I', b'H', b'D', b'R', 0, 0, 0, 1, 0, 0, 0, 1]);
        bytes
    }

    /// JSON whose serialized form embeds a script tag.
    pub fn script_json() -> Value {
        json!({"name": "x", "description": "<script>alert(1)</script>"})
    }

    /// A JSON document of at least `min_bytes` serialized bytes.
    pub fn oversized_json(min_bytes: usize) -> Value {
        json!({"name": "big", "blob": "a".repeat(min_bytes)})
    }

    /// Configuration pointing at `gateways` with short timeouts and no backoff.
    pub fn test_config(gateways: &[&str]) -> FetchConfig {
        let mut config = FetchConfig {
            gateways: gateways.iter().map(|g| g.to_string()).collect(),
            request_timeout_ms: 1_000,
            ..FetchConfig::default()
        };
        config.retry.initial_backoff_ms = 0;
        config.retry.max_backoff_ms = 0;
        config
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for ipfetch inputs.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    /// Valid CIDs of every recognized shape.
    pub fn arb_valid_cid() -> impl Strategy<Value = String> {
        prop_oneof![
            "[1-9A-HJ-NP-Za-km-z]{44}".prop_map(|body| format!("Qm{}", body)),
            "[a-z2-7]{58,70}".prop_map(|body| format!("b{}", body)),
            "[1-9A-HJ-NP-Za-km-z]{48,60}".prop_map(|body| format!("z{}", body)),
        ]
    }

    /// Strings that can never be a CID.
    pub fn arb_invalid_cid() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-zA-Z0-9]{0,45}",
            "Qm[0OIl]{44}",
            "[ ./:]{1,4}Qm[1-9A-HJ-NP-Za-km-z]{44}",
        ]
    }

    pub fn arb_content_kind() -> impl Strategy<Value = ContentKind> {
        prop::sample::select(ContentKind::ALL.to_vec())
    }

    /// Small JSON trees of bounded depth.
    pub fn arb_json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| Value::from(n)),
            "[a-z ]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::vec(("[a-z_]{1,10}", inner), 0..4)
                    .prop_map(|pairs| Value::Object(pairs.into_iter().collect())),
            ]
        })
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on the ipfetch error taxonomy.

    use super::*;

    #[track_caller]
    pub fn assert_invalid_cid<T: std::fmt::Debug>(result: &Result<T, FetchError>) {
        match result {
            Err(FetchError::InvalidCid { .. }) => {}
            other => panic!("Expected InvalidCid, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_gateway_exhausted<T: std::fmt::Debug>(result: &Result<T, FetchError>) {
        match result {
            Err(FetchError::Gateway(GatewayError::Exhausted { .. })) => {}
            other => panic!("Expected GatewayExhausted, got: {:?}", other),
        }
    }

    /// Assert a validation failure with the given reason code.
    #[track_caller]
    pub fn assert_validation_reason<T: std::fmt::Debug>(
        result: &Result<T, FetchError>,
        reason_code: &str,
    ) {
        match result {
            Err(FetchError::Validation(e)) if e.reason_code() == reason_code => {}
            other => panic!("Expected validation error {}, got: {:?}", reason_code, other),
        }
    }
}
