//! Property Tests for the Fetch Pipeline
//!
//! Properties:
//! - malformed CIDs never reach a gateway
//! - concurrent identical fetches share one gateway request
//! - cache entries live exactly as long as their TTL
//! - oversized and script-bearing payloads are rejected and never cached
//! - multi-fetch isolates per-item failures
//! - prefetch never surfaces an error
//! - gateway fallback records per-gateway outcomes

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use ipfetch_core::{ContentKind, FetchConfig, ManualClock};
use ipfetch_fetch::{ContentFetcher, FetchItem, FetchOptions, MultiFetchOptions};
use ipfetch_test_utils::assertions::{assert_invalid_cid, assert_validation_reason};
use ipfetch_test_utils::fixtures::{self, CID_V0};
use ipfetch_test_utils::generators::{arb_content_kind, arb_invalid_cid};
use ipfetch_test_utils::{ScriptedResponse, ScriptedTransport};
use proptest::prelude::*;
use serde_json::json;

const G1: &str = "https://g1.test/ipfs";
const G2: &str = "https://g2.test/ipfs";

fn fetcher(config: FetchConfig, transport: &Arc<ScriptedTransport>) -> ContentFetcher {
    ContentFetcher::builder()
        .config(config)
        .transport(transport.clone())
        .build()
        .expect("test config is valid")
}

fn json_transport() -> Arc<ScriptedTransport> {
    Arc::new(ScriptedTransport::new().with_default(ScriptedResponse::json(&fixtures::metadata_json())))
}

// ============================================================================
// CID GATE
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_invalid_cid_makes_no_gateway_call(cid in arb_invalid_cid(), kind in arb_content_kind()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let transport = json_transport();
        let fetcher = fetcher(fixtures::test_config(&[G1]), &transport);

        let result = runtime.block_on(fetcher.fetch(&cid, kind));

        assert_invalid_cid(&result);
        prop_assert_eq!(transport.calls(), 0);
    }
}

// ============================================================================
// DEDUPLICATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_identical_fetches_share_one_request() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_default(ScriptedResponse::json(&fixtures::metadata_json()))
            .with_delay(Duration::from_millis(50)),
    );
    let fetcher = fetcher(fixtures::test_config(&[G1]), &transport);

    let calls = (0..10).map(|_| fetcher.fetch(CID_V0, ContentKind::Metadata));
    let results = join_all(calls).await;

    assert_eq!(transport.calls(), 1);
    let first = results[0].as_ref().expect("fetch succeeds");
    assert!(results.iter().all(|r| r.as_ref() == Ok(first)));
    assert_eq!(fetcher.stats().await.deduplicated, 9);
}

// ============================================================================
// TTL
// ============================================================================

#[tokio::test]
async fn test_cache_entry_lives_exactly_its_ttl() {
    let transport = json_transport();
    let clock = ManualClock::default();
    let fetcher = ContentFetcher::builder()
        .config(fixtures::test_config(&[G1]))
        .transport(transport.clone())
        .clock(Arc::new(clock.clone()))
        .build()
        .expect("test config is valid");
    let opts = FetchOptions {
        skip_cache: false,
        custom_ttl: Some(Duration::from_secs(60)),
    };

    fetcher
        .fetch_content(CID_V0, ContentKind::Metadata, opts)
        .await
        .expect("first fetch");
    assert_eq!(transport.calls(), 1);

    clock.advance(Duration::from_millis(59_999));
    fetcher
        .fetch_content(CID_V0, ContentKind::Metadata, opts)
        .await
        .expect("cached fetch");
    assert_eq!(transport.calls(), 1, "entry must still be live at T-1ms");

    clock.advance(Duration::from_millis(2));
    assert!(fetcher.cache().get(CID_V0).await.is_none(), "entry must be gone at T+1ms");
    fetcher
        .fetch_content(CID_V0, ContentKind::Metadata, opts)
        .await
        .expect("refetch");
    assert_eq!(transport.calls(), 2);
    assert_eq!(fetcher.stats().await.cache.expired, 1);
}

// ============================================================================
// VALIDATION
// ============================================================================

#[tokio::test]
async fn test_oversized_json_is_rejected_and_not_cached() {
    let limit = FetchConfig::default().limits.json.max_bytes;
    let transport = Arc::new(
        ScriptedTransport::new().with_default(ScriptedResponse::json(&fixtures::oversized_json(limit + 1))),
    );
    let fetcher = fetcher(fixtures::test_config(&[G1]), &transport);

    let result = fetcher.fetch(CID_V0, ContentKind::Json).await;

    assert_validation_reason(&result, "SIZE_EXCEEDED");
    assert!(fetcher.cache().get(CID_V0).await.is_none());
    assert_eq!(fetcher.stats().await.cache.count, 0);
}

#[tokio::test]
async fn test_script_payload_is_rejected_for_every_kind() {
    let transport = Arc::new(
        ScriptedTransport::new().with_default(ScriptedResponse::json(&fixtures::script_json())),
    );
    let fetcher = fetcher(fixtures::test_config(&[G1]), &transport);

    for kind in ContentKind::ALL {
        let result = fetcher.fetch(CID_V0, kind).await;
        assert_validation_reason(&result, "MALICIOUS_CONTENT_DETECTED");
    }
    assert_eq!(fetcher.stats().await.cache.count, 0);
}

// ============================================================================
// MULTI-FETCH
// ============================================================================

#[tokio::test]
async fn test_one_failing_cid_does_not_affect_the_rest() {
    let cids: Vec<String> = (1..=10).map(fixtures::cid).collect();
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_default(ScriptedResponse::json(&json!({"ok": true})))
            .on_cid(&cids[4], ScriptedResponse::Status(500)),
    );
    let fetcher = fetcher(fixtures::test_config(&[G1]), &transport);
    let items: Vec<FetchItem> = cids.iter().map(|c| FetchItem::new(c.as_str(), ContentKind::Json)).collect();

    let outcome = fetcher.fetch_multiple(&items, MultiFetchOptions::default()).await;

    assert_eq!(outcome.success_count, 9);
    assert_eq!(outcome.error_count, 1);
    assert_eq!(outcome.results.len(), 9);
    assert!(!outcome.results.contains_key(&cids[4]));
    assert!(outcome.errors.contains_key(&cids[4]));
    for (i, cid) in cids.iter().enumerate().filter(|(i, _)| *i != 4) {
        assert!(outcome.results.contains_key(cid), "missing result for CID #{}", i + 1);
    }
}

#[tokio::test]
async fn test_repeated_cid_is_counted_once() {
    let other = fixtures::cid(7);
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_default(ScriptedResponse::json(&fixtures::metadata_json()))
            .on_cid(&other, ScriptedResponse::Status(500)),
    );
    let fetcher = fetcher(fixtures::test_config(&[G1]), &transport);
    let items = vec![
        FetchItem::new(CID_V0, ContentKind::Json),
        FetchItem::new(CID_V0, ContentKind::Metadata),
        FetchItem::new(other.as_str(), ContentKind::Json),
        FetchItem::new(other.as_str(), ContentKind::Profile),
    ];

    let outcome = fetcher.fetch_multiple(&items, MultiFetchOptions::default()).await;

    assert_eq!(outcome.success_count, outcome.results.len());
    assert_eq!(outcome.error_count, outcome.errors.len());
    assert_eq!((outcome.success_count, outcome.error_count), (1, 1));
    assert_eq!(outcome.results[CID_V0].kind(), ContentKind::Json);
    assert_eq!(transport.calls_for(CID_V0), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_progress_reports_every_item_once(
        failing in prop::collection::vec(any::<bool>(), 0..16),
        width in 1usize..6,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let cids: Vec<String> = (0..failing.len() as u64).map(fixtures::cid).collect();
        let mut script = ScriptedTransport::new().with_default(ScriptedResponse::json(&json!({"ok": true})));
        for (cid, fails) in cids.iter().zip(&failing) {
            if *fails {
                script = script.on_cid(cid, ScriptedResponse::Status(500));
            }
        }
        let transport = Arc::new(script);
        let fetcher = fetcher(fixtures::test_config(&[G1]), &transport);
        let items: Vec<FetchItem> = cids.iter().map(|c| FetchItem::new(c.as_str(), ContentKind::Json)).collect();

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let opts = MultiFetchOptions::default()
            .max_concurrent(width)
            .on_progress(move |percent, done, total| sink.lock().unwrap().push((percent, done, total)));

        let outcome = runtime.block_on(fetcher.fetch_multiple(&items, opts));

        let total = items.len();
        let expected_failures = failing.iter().filter(|f| **f).count();
        prop_assert_eq!(outcome.error_count, expected_failures);
        prop_assert_eq!(outcome.success_count + outcome.error_count, total);

        let reports = reports.lock().unwrap();
        prop_assert_eq!(reports.len(), total);
        for (i, (percent, done, reported_total)) in reports.iter().enumerate() {
            prop_assert_eq!(*done, i + 1);
            prop_assert_eq!(*reported_total, total);
            prop_assert!(*percent > 0.0 && *percent <= 100.0);
        }
        if let Some((percent, _, _)) = reports.last() {
            prop_assert!((*percent - 100.0).abs() < f64::EPSILON);
        }
    }
}

// ============================================================================
// PREFETCH
// ============================================================================

#[tokio::test]
async fn test_prefetch_of_failing_cid_never_surfaces_an_error() {
    let transport = Arc::new(ScriptedTransport::new().with_default(ScriptedResponse::Status(500)));
    let fetcher = fetcher(fixtures::test_config(&[G1, G2]), &transport);

    let handle = fetcher
        .prefetch(CID_V0, ContentKind::Metadata)
        .expect("inside a runtime");
    handle.await.expect("prefetch task does not panic");

    assert_eq!(transport.calls(), 2);
    assert_eq!(fetcher.stats().await.cache.count, 0);
}

#[test]
fn test_prefetch_outside_runtime_is_a_no_op() {
    let transport = json_transport();
    let fetcher = fetcher(fixtures::test_config(&[G1]), &transport);

    assert!(fetcher.prefetch(CID_V0, ContentKind::Json).is_none());
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_prefetch_warms_the_cache() {
    let transport = json_transport();
    let fetcher = fetcher(fixtures::test_config(&[G1]), &transport);

    fetcher
        .prefetch(CID_V0, ContentKind::Metadata)
        .expect("inside a runtime")
        .await
        .expect("prefetch task does not panic");
    fetcher.fetch(CID_V0, ContentKind::Metadata).await.expect("cached fetch");

    assert_eq!(transport.calls(), 1);
}

// ============================================================================
// GATEWAY FALLBACK
// ============================================================================

#[tokio::test]
async fn test_failing_primary_falls_back_and_records_stats() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .on_gateway(G1, ScriptedResponse::Status(500))
            .on_gateway(G2, ScriptedResponse::json(&json!({"hello": "world"}))),
    );
    let fetcher = fetcher(fixtures::test_config(&[G1, G2]), &transport);

    let content = fetcher.fetch(CID_V0, ContentKind::Json).await.expect("g2 answers");
    assert_eq!(content.as_json(), Some(&json!({"hello": "world"})));

    let stats = fetcher.stats().await;
    let g1 = stats.gateways.endpoint(G1).expect("g1 stats");
    let g2 = stats.gateways.endpoint(G2).expect("g2 stats");
    assert_eq!((g1.failures, g1.successes), (1, 0));
    assert_eq!((g2.failures, g2.successes), (0, 1));
    assert_eq!(transport.call_log(), vec![
        (G1.to_string(), CID_V0.to_string()),
        (G2.to_string(), CID_V0.to_string()),
    ]);
}
