//! REST handlers for the ad request endpoint and operational probes.

use crate::render;
use crate::state::AppState;
use adserve_analytics::{AdEvent, AdEventKind};
use adserve_core::error::AdError;
use adserve_core::openrtb::{nobid, AdRequest, AdResponse, SeatBid};
use adserve_engine::SelectAdRequest;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error};

/// POST /v1/ad — decide one ad for the request's first impression.
pub async fn handle_ad(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<AdRequest>,
) -> Response {
    let started = Instant::now();
    metrics::counter!("api.ad_requests").increment(1);

    // Publisher authentication: X-API-Key against the catalog.
    let publisher_id = request.ext.as_ref().map(|e| e.publisher_id).unwrap_or(0);
    let Some(publisher) = state.store.get_publisher(publisher_id) else {
        metrics::counter!("api.auth_failures").increment(1);
        return unauthorized();
    };
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented != publisher.api_key {
        metrics::counter!("api.auth_failures").increment(1);
        return unauthorized();
    }

    let Some(imp) = request.imp.first() else {
        return bad_request("request carries no impression");
    };

    // Placement ownership: a publisher can only fill its own slots.
    if let Some(placement) = state.store.get_placement(&imp.tagid) {
        if placement.publisher_id != publisher.id {
            return Json(AdResponse::no_ad(request.id.clone(), nobid::INVALID_REQUEST))
                .into_response();
        }
    }

    let user_id = request
        .user
        .as_ref()
        .map(|u| u.id.as_str())
        .unwrap_or("")
        .to_string();
    let ua = request
        .device
        .as_ref()
        .map(|d| d.ua.as_str())
        .unwrap_or("");
    let ip = client_ip(&request, &headers, connect_info.map(|c| c.0));
    let kv = request
        .ext
        .as_ref()
        .map(|e| e.kv.clone())
        .unwrap_or_default();

    let targeting = state.resolver.resolve(ua, &ip, kv);

    let outcome = state
        .engine
        .select_ad(SelectAdRequest {
            request_id: &request.id,
            imp_id: &imp.id,
            placement_id: &imp.tagid,
            user_id: &user_id,
            width: imp.w,
            height: imp.h,
            targeting: &targeting,
            trace: false,
        })
        .await;

    match outcome {
        Ok(selection) => {
            if let Some(steps) = &selection.trace {
                debug!(request_id = %request.id, steps = ?steps, "Selection trace");
            }

            let mut event =
                AdEvent::new(AdEventKind::Serve, request.id.clone(), publisher.id);
            event.placement_id = Some(imp.tagid.clone());
            event.campaign_id = Some(selection.creative.campaign_id);
            event.line_item_id = Some(selection.line_item.id);
            event.creative_id = Some(selection.creative.id);
            event.user_id = Some(user_id.clone());
            event.price = Some(selection.price);
            event.latency_us = Some(started.elapsed().as_micros() as u64);
            state.analytics.log(event);

            let bid = render::build_bid(&state, &request.id, &imp.id, &user_id, &selection);
            let response = AdResponse {
                id: request.id.clone(),
                seatbid: vec![SeatBid { bid: vec![bid] }],
                nbr: None,
            };
            metrics::histogram!("api.ad_latency_us")
                .record(started.elapsed().as_micros() as f64);
            Json(response).into_response()
        }
        Err(failure) => {
            if let Some(steps) = &failure.trace {
                debug!(request_id = %request.id, steps = ?steps, "Selection trace");
            }
            let reason = match &failure.error {
                AdError::NoAd => nobid::NO_FILL,
                AdError::PacingLimitReached => nobid::DAILY_CAP_REACHED,
                AdError::RateLimitReached => nobid::TECHNICAL,
                AdError::UnknownPlacement(_) => nobid::INVALID_REQUEST,
                AdError::CounterStoreUnavailable => nobid::TECHNICAL,
                other => {
                    error!(error = %other, request_id = %request.id, "Ad selection failed");
                    metrics::counter!("api.errors").increment(1);
                    return internal_error(other);
                }
            };

            let mut event = AdEvent::new(AdEventKind::NoAd, request.id.clone(), publisher.id);
            event.placement_id = Some(imp.tagid.clone());
            event.user_id = Some(user_id);
            event.latency_us = Some(started.elapsed().as_micros() as u64);
            state.analytics.log(event);

            Json(AdResponse::no_ad(request.id.clone(), reason)).into_response()
        }
    }
}

/// Prefer the device IP from the body, then the first forwarded-for hop,
/// then the socket peer.
fn client_ip(request: &AdRequest, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(device) = &request.device {
        if !device.ip.is_empty() {
            return device.ip.clone();
        }
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "unauthorized".to_string(),
            message: "missing or invalid API key".to_string(),
        }),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "invalid_request".to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

fn internal_error(error: &AdError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "selection_failed".to_string(),
            message: error.to_string(),
        }),
    )
        .into_response()
}

/// GET /health — liveness plus basic catalog stats.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.store.snapshot();
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        line_items: snapshot.line_item_count(),
        creatives: snapshot.creative_count(),
    })
}

/// GET /ready — readiness probe.
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /live — liveness probe.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub line_items: usize,
    pub creatives: usize,
}
