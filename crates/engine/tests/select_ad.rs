//! End-to-end selection scenarios against an in-memory counter backend.

use adserve_bidder::ProgrammaticBidder;
use adserve_core::config::{BiddingConfig, CtrConfig, EngineConfig, PacingConfig, RateLimitConfig};
use adserve_core::error::AdError;
use adserve_core::types::{Campaign, Creative, Placement, Publisher, TargetingContext};
use adserve_counters::{keys, CounterStore};
use adserve_ctr::CtrPredictor;
use adserve_delivery::RateLimiter;
use adserve_engine::{DecisionEngine, SelectAdRequest};
use adserve_store::AdStore;
use std::sync::Arc;

fn publisher() -> Publisher {
    Publisher {
        id: 1,
        name: "acme".to_string(),
        domain: "acme.test".to_string(),
        api_key: "k1".to_string(),
        allowed_event_types: Vec::new(),
    }
}

fn placement() -> Placement {
    Placement {
        id: "slot-top".to_string(),
        publisher_id: 1,
        width: 300,
        height: 250,
        allowed_formats: Vec::new(),
    }
}

fn campaign() -> Campaign {
    Campaign {
        id: 10,
        publisher_id: 1,
        name: "launch".to_string(),
    }
}

fn line_item(json: serde_json::Value) -> adserve_core::types::LineItem {
    serde_json::from_value(json).expect("line item deserializes")
}

fn creative(id: i64, line_item_id: i64) -> Creative {
    Creative {
        id,
        placement_id: "slot-top".to_string(),
        line_item_id,
        campaign_id: 10,
        publisher_id: 1,
        html: Some(format!("<div>cr-{id}</div>")),
        native: None,
        banner: None,
        width: 300,
        height: 250,
        format: String::new(),
        click_url: None,
    }
}

struct Harness {
    counters: CounterStore,
    engine: DecisionEngine,
}

fn harness(
    line_items: Vec<adserve_core::types::LineItem>,
    creatives: Vec<Creative>,
    engine_config: EngineConfig,
    rate_limit: RateLimitConfig,
    ctr_config: CtrConfig,
) -> Harness {
    let store = Arc::new(AdStore::new());
    store
        .reload_all(
            line_items,
            vec![campaign()],
            vec![publisher()],
            vec![placement()],
            creatives,
        )
        .expect("valid catalog");

    let counters = CounterStore::memory();
    let engine = DecisionEngine::new(
        store.clone(),
        counters.clone(),
        Arc::new(RateLimiter::new(rate_limit)),
        ProgrammaticBidder::new(&BiddingConfig::default()),
        Arc::new(CtrPredictor::new(&ctr_config)),
        &engine_config,
        &PacingConfig::default(),
    );
    Harness { counters, engine }
}

fn default_harness(
    line_items: Vec<adserve_core::types::LineItem>,
    creatives: Vec<Creative>,
) -> Harness {
    harness(
        line_items,
        creatives,
        EngineConfig::default(),
        RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        },
        CtrConfig::default(),
    )
}

fn request<'a>(targeting: &'a TargetingContext) -> SelectAdRequest<'a> {
    SelectAdRequest {
        request_id: "req-1",
        imp_id: "imp-1",
        placement_id: "slot-top",
        user_id: "user-1",
        width: 0,
        height: 0,
        targeting,
        trace: false,
    }
}

#[tokio::test]
async fn test_asap_item_serves_and_counts() {
    let h = default_harness(
        vec![line_item(serde_json::json!({
            "id": 100, "campaign_id": 10, "publisher_id": 1, "name": "asap",
            "active": true, "pace_mode": "ASAP", "daily_impression_cap": 3,
            "cpm": 2.0, "ecpm": 2.0,
        }))],
        vec![creative(1, 100)],
    );

    // Two serves already on the books today.
    let today = keys::today();
    let serves_key = keys::serves(100, &today);
    for _ in 0..2 {
        h.counters
            .incr_with_ttl(&serves_key, keys::DAILY_TTL)
            .await
            .expect("seed");
    }

    let ctx = TargetingContext::default();
    let selection = h.engine.select_ad(request(&ctx)).await.expect("selects");
    assert_eq!(selection.creative.id, 1);
    // Placement dimensions inherited for w=0/h=0.
    assert_eq!(selection.width, 300);
    assert_eq!(selection.height, 250);

    // Post-selection the serve counter sits at the cap.
    let count = h.counters.get_int(&serves_key).await.expect("get");
    assert_eq!(count, Some(3));

    // The next request finds the cap exhausted.
    let failure = h
        .engine
        .select_ad(request(&ctx))
        .await
        .expect_err("cap reached");
    assert!(matches!(failure.error, AdError::PacingLimitReached));
}

#[tokio::test]
async fn test_higher_ecpm_wins_within_tier() {
    let h = default_harness(
        vec![
            line_item(serde_json::json!({
                "id": 100, "campaign_id": 10, "publisher_id": 1, "name": "a",
                "active": true, "priority": "medium", "cpm": 5.0, "ecpm": 5.0,
            })),
            line_item(serde_json::json!({
                "id": 101, "campaign_id": 10, "publisher_id": 1, "name": "b",
                "active": true, "priority": "medium", "cpm": 4.0, "ecpm": 4.0,
            })),
        ],
        vec![creative(1, 100), creative(2, 101)],
    );

    let ctx = TargetingContext::default();
    for _ in 0..20 {
        let selection = h.engine.select_ad(request(&ctx)).await.expect("selects");
        assert_eq!(selection.line_item.id, 100, "5.0 eCPM always beats 4.0");
    }
}

#[tokio::test]
async fn test_priority_beats_price() {
    let h = default_harness(
        vec![
            line_item(serde_json::json!({
                "id": 100, "campaign_id": 10, "publisher_id": 1, "name": "hi",
                "active": true, "priority": "high", "cpm": 1.0, "ecpm": 1.0,
            })),
            line_item(serde_json::json!({
                "id": 101, "campaign_id": 10, "publisher_id": 1, "name": "med",
                "active": true, "priority": "medium", "cpm": 10.0, "ecpm": 10.0,
            })),
        ],
        vec![creative(1, 100), creative(2, 101)],
    );

    let ctx = TargetingContext::default();
    for _ in 0..20 {
        let selection = h.engine.select_ad(request(&ctx)).await.expect("selects");
        assert_eq!(selection.line_item.id, 100);
    }
}

#[tokio::test]
async fn test_unknown_placement() {
    let h = default_harness(vec![], vec![]);
    let ctx = TargetingContext::default();
    let failure = h
        .engine
        .select_ad(SelectAdRequest {
            placement_id: "nope",
            ..request(&ctx)
        })
        .await
        .expect_err("unknown placement");
    assert!(matches!(failure.error, AdError::UnknownPlacement(_)));
}

#[tokio::test]
async fn test_frequency_cap_filters_user() {
    let h = default_harness(
        vec![line_item(serde_json::json!({
            "id": 100, "campaign_id": 10, "publisher_id": 1, "name": "capped",
            "active": true, "frequency_cap": 1, "cpm": 2.0, "ecpm": 2.0,
        }))],
        vec![creative(1, 100)],
    );

    let ctx = TargetingContext::default();
    let first = h.engine.select_ad(request(&ctx)).await;
    assert!(first.is_ok());

    // The impression pixel fires, recording one exposure for this user.
    h.counters
        .incr_with_ttl(&keys::frequency("user-1", 100), keys::DAILY_TTL)
        .await
        .expect("pixel");

    let failure = h
        .engine
        .select_ad(request(&ctx))
        .await
        .expect_err("user is capped");
    assert!(matches!(failure.error, AdError::PacingLimitReached));

    // A different user is unaffected.
    let other = h
        .engine
        .select_ad(SelectAdRequest {
            user_id: "user-2",
            ..request(&ctx)
        })
        .await;
    assert!(other.is_ok());
}

#[tokio::test]
async fn test_targeting_mismatch_is_no_ad() {
    let h = default_harness(
        vec![line_item(serde_json::json!({
            "id": 100, "campaign_id": 10, "publisher_id": 1, "name": "de-only",
            "active": true, "country": "DE", "cpm": 2.0, "ecpm": 2.0,
        }))],
        vec![creative(1, 100)],
    );

    let ctx = TargetingContext {
        country: "US".to_string(),
        ..TargetingContext::default()
    };
    let failure = h
        .engine
        .select_ad(request(&ctx))
        .await
        .expect_err("nothing targets US");
    assert!(matches!(failure.error, AdError::NoAd));
}

#[tokio::test]
async fn test_programmatic_no_bid_is_dropped() {
    // Nothing listens on the endpoint, so the callout yields no bid.
    let h = default_harness(
        vec![line_item(serde_json::json!({
            "id": 100, "campaign_id": 10, "publisher_id": 1, "name": "prog",
            "active": true, "type": "PROGRAMMATIC",
            "programmatic_endpoint": "http://127.0.0.1:9/bid",
        }))],
        vec![creative(1, 100)],
    );

    let ctx = TargetingContext::default();
    let failure = h
        .engine
        .select_ad(request(&ctx))
        .await
        .expect_err("only candidate had no bid");
    assert!(matches!(failure.error, AdError::NoAd));
}

#[tokio::test]
async fn test_rate_limit_exhaustion() {
    let h = harness(
        vec![line_item(serde_json::json!({
            "id": 100, "campaign_id": 10, "publisher_id": 1, "name": "li",
            "active": true, "cpm": 2.0, "ecpm": 2.0,
        }))],
        vec![creative(1, 100)],
        EngineConfig::default(),
        RateLimitConfig {
            enabled: true,
            capacity: 1.0,
            refill_rate: 0.0,
        },
        CtrConfig::default(),
    );

    let ctx = TargetingContext::default();
    assert!(h.engine.select_ad(request(&ctx)).await.is_ok());

    let failure = h
        .engine
        .select_ad(request(&ctx))
        .await
        .expect_err("bucket is empty");
    assert!(matches!(failure.error, AdError::RateLimitReached));
}

#[tokio::test]
async fn test_trace_round_trip() {
    let h = default_harness(
        vec![line_item(serde_json::json!({
            "id": 100, "campaign_id": 10, "publisher_id": 1, "name": "li",
            "active": true, "cpm": 2.0, "ecpm": 2.0,
        }))],
        vec![creative(1, 100)],
    );

    let ctx = TargetingContext::default();

    let untraced = h.engine.select_ad(request(&ctx)).await.expect("selects");
    assert!(untraced.trace.is_none());

    let traced = h
        .engine
        .select_ad(SelectAdRequest {
            trace: true,
            ..request(&ctx)
        })
        .await
        .expect("selects");
    let steps = traced.trace.expect("trace collected");
    let labels: Vec<&str> = steps.iter().map(|s| s.label.as_str()).collect();
    assert!(labels.contains(&"start"));
    assert!(labels.contains(&"single_pass_complete"));
    assert!(labels.contains(&"rank"));
    assert!(labels.contains(&"selected"));
}

/// CTR predictor stub serving a fixed boost, counting how often it is hit.
async fn spawn_ctr_stub(hits: Arc<std::sync::atomic::AtomicUsize>) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut buf = vec![0u8; 8192];
            let mut read = 0;
            loop {
                let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                read += n;
                if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let body = r#"{"ctr_score":0.05,"confidence":0.8,"boost_multiplier":2.0}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_ctr_predictor_queried_once_per_line_item() {
    let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let url = spawn_ctr_stub(hits.clone()).await;

    // Two creatives share one CPC line item: one predictor call total.
    let h = harness(
        vec![line_item(serde_json::json!({
            "id": 100, "campaign_id": 10, "publisher_id": 1, "name": "cpc",
            "active": true, "budget_type": "CPC", "cpc": 0.5, "ecpm": 1.5,
        }))],
        vec![creative(1, 100), creative(2, 100)],
        EngineConfig::default(),
        RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        },
        CtrConfig {
            enabled: true,
            predictor_url: url,
            timeout_ms: 100,
            cache_ttl_secs: 0,
        },
    );

    let ctx = TargetingContext::default();
    let selection = h.engine.select_ad(request(&ctx)).await.expect("selects");
    assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    // Boost 2.0 over stored eCPM 1.5.
    assert!((selection.price - 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_ctr_disabled_leaves_prices_untouched() {
    let h = default_harness(
        vec![line_item(serde_json::json!({
            "id": 100, "campaign_id": 10, "publisher_id": 1, "name": "cpc",
            "active": true, "budget_type": "CPC", "cpc": 0.5, "ecpm": 1.5,
        }))],
        vec![creative(1, 100)],
    );

    let ctx = TargetingContext::default();
    let selection = h.engine.select_ad(request(&ctx)).await.expect("selects");
    assert!((selection.price - 1.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_tied_candidates_split_selections() {
    let h = default_harness(
        vec![
            line_item(serde_json::json!({
                "id": 100, "campaign_id": 10, "publisher_id": 1, "name": "a",
                "active": true, "priority": "medium", "cpm": 2.0, "ecpm": 2.0,
            })),
            line_item(serde_json::json!({
                "id": 101, "campaign_id": 10, "publisher_id": 1, "name": "b",
                "active": true, "priority": "medium", "cpm": 2.0, "ecpm": 2.0,
            })),
        ],
        vec![creative(1, 100), creative(2, 101)],
    );

    let ctx = TargetingContext::default();
    let mut first = 0u32;
    let runs = 400;
    for _ in 0..runs {
        let selection = h.engine.select_ad(request(&ctx)).await.expect("selects");
        if selection.creative.id == 1 {
            first += 1;
        }
    }
    let share = f64::from(first) / f64::from(runs);
    assert!(share > 0.3 && share < 0.7, "tie share was {share}");
}
