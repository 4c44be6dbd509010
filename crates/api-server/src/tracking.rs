//! Tracking endpoints: impression pixel, click redirect, custom events and
//! engagement reports.
//!
//! Token verification failures are never fatal; the hit is rejected and the
//! caller still receives the pixel so broken pages do not surface errors.

use crate::state::AppState;
use adserve_analytics::{AdEvent, AdEventKind};
use adserve_core::token::{self, TrackingToken};
use adserve_core::types::BudgetType;
use adserve_counters::keys;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

/// 1×1 transparent GIF.
const PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

#[derive(Deserialize)]
pub struct TrackParams {
    t: String,
    #[serde(rename = "type")]
    event_type: Option<String>,
}

fn pixel() -> Response {
    ([(header::CONTENT_TYPE, "image/gif")], PIXEL_GIF).into_response()
}

fn verify(state: &AppState, raw: &str) -> Option<TrackingToken> {
    match token::verify(raw, state.token.secret.as_bytes(), state.token.ttl()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            metrics::counter!("tracking.invalid_tokens").increment(1);
            debug!(error = %e, "Rejected tracking token");
            None
        }
    }
}

/// GET /track/impression — the billable impression pixel. Moves the
/// impression and frequency counters; the serve counter moved at selection.
pub async fn handle_impression(
    State(state): State<AppState>,
    Query(params): Query<TrackParams>,
) -> Response {
    let Some(tok) = verify(&state, &params.t) else {
        return pixel();
    };
    metrics::counter!("tracking.impressions").increment(1);

    let today = keys::today();
    if let Err(e) = state
        .counters
        .incr_with_ttl(&keys::impressions(tok.l, &today), keys::DAILY_TTL)
        .await
    {
        warn!(error = %e, line_item_id = tok.l, "Impression counter increment failed");
    }

    let line_item = state.store.get_line_item(tok.p, tok.l);

    if !tok.u.is_empty() {
        let window = line_item
            .as_ref()
            .map(|li| li.frequency_window())
            .unwrap_or(keys::DAILY_TTL);
        if let Err(e) = state
            .counters
            .incr_with_ttl(&keys::frequency(&tok.u, tok.l), window)
            .await
        {
            warn!(error = %e, line_item_id = tok.l, "Frequency counter increment failed");
        }
    }

    // CPM budgets accrue spend per billable impression.
    if let Some(li) = &line_item {
        if li.budget_type == BudgetType::Cpm {
            state.store.add_line_item_spend(tok.p, tok.l, tok.bp / 1000.0);
        }
    }

    let mut event = AdEvent::new(AdEventKind::Impression, tok.r.clone(), tok.p);
    event.placement_id = Some(tok.pl.clone());
    event.campaign_id = Some(tok.cid);
    event.line_item_id = Some(tok.l);
    event.creative_id = Some(tok.c);
    event.user_id = (!tok.u.is_empty()).then(|| tok.u.clone());
    event.price = Some(tok.bp);
    state.analytics.log(event);

    pixel()
}

/// GET /track/click — click counter plus redirect to the landing URL.
pub async fn handle_click(
    State(state): State<AppState>,
    Query(params): Query<TrackParams>,
) -> Response {
    let Some(tok) = verify(&state, &params.t) else {
        return pixel();
    };
    metrics::counter!("tracking.clicks").increment(1);

    let today = keys::today();
    if let Err(e) = state
        .counters
        .incr_with_ttl(&keys::clicks(tok.l, &today), keys::DAILY_TTL)
        .await
    {
        warn!(error = %e, line_item_id = tok.l, "Click counter increment failed");
    }

    let line_item = state.store.get_line_item(tok.p, tok.l);

    // CPC budgets accrue spend per click.
    if let Some(li) = &line_item {
        if li.budget_type == BudgetType::Cpc {
            state.store.add_line_item_spend(tok.p, tok.l, li.cpc);
        }
    }

    let click_id = Uuid::new_v4().to_string();
    let mut event = AdEvent::new(AdEventKind::Click, tok.r.clone(), tok.p);
    event.placement_id = Some(tok.pl.clone());
    event.campaign_id = Some(tok.cid);
    event.line_item_id = Some(tok.l);
    event.creative_id = Some(tok.c);
    event.user_id = (!tok.u.is_empty()).then(|| tok.u.clone());
    state.analytics.log(event);

    match resolve_click_url(&state, &tok) {
        Some(url) => Redirect::temporary(&expand_macros(&url, &tok, &click_id)).into_response(),
        None => pixel(),
    }
}

/// The creative's click URL overrides the line item's.
fn resolve_click_url(state: &AppState, tok: &TrackingToken) -> Option<String> {
    let snapshot = state.store.snapshot();
    let creative_url = snapshot
        .creatives_for_placement(&tok.pl)
        .iter()
        .find(|c| c.id == tok.c)
        .and_then(|c| c.click_url.clone());
    if creative_url.is_some() {
        return creative_url;
    }
    snapshot
        .get_line_item(tok.p, tok.l)
        .and_then(|li| li.click_url.clone())
}

fn expand_macros(url: &str, tok: &TrackingToken, click_id: &str) -> String {
    url.replace("{CLICK_ID}", click_id)
        .replace("{LINE_ITEM_ID}", &tok.l.to_string())
        .replace("{PUBLISHER_ID}", &tok.p.to_string())
        .replace("{TIMESTAMP}", &Utc::now().timestamp().to_string())
}

/// GET /track/event — custom events, gated on the publisher's allow-list.
pub async fn handle_event(
    State(state): State<AppState>,
    Query(params): Query<TrackParams>,
) -> Response {
    let Some(tok) = verify(&state, &params.t) else {
        return pixel();
    };
    let Some(event_type) = params.event_type.as_deref().map(sanitize_event_type) else {
        return pixel();
    };
    if event_type.is_empty() {
        return pixel();
    }

    let allowed = state
        .store
        .get_publisher(tok.p)
        .is_some_and(|p| p.allowed_event_types.iter().any(|t| t == &event_type));
    if !allowed {
        metrics::counter!("tracking.events_rejected").increment(1);
        return pixel();
    }
    metrics::counter!("tracking.events").increment(1);

    let today = keys::today();
    if let Err(e) = state
        .counters
        .incr_with_ttl(&keys::custom_event(&event_type, tok.l, &today), keys::DAILY_TTL)
        .await
    {
        warn!(error = %e, line_item_id = tok.l, "Event counter increment failed");
    }

    let mut event = AdEvent::new(AdEventKind::Custom, tok.r.clone(), tok.p);
    event.placement_id = Some(tok.pl.clone());
    event.line_item_id = Some(tok.l);
    event.creative_id = Some(tok.c);
    event.event_type = Some(event_type);
    state.analytics.log(event);

    pixel()
}

fn sanitize_event_type(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(32)
        .collect::<String>()
        .to_lowercase()
}

/// POST /track/report — token-authenticated engagement report sink.
pub async fn handle_report(
    State(state): State<AppState>,
    Query(params): Query<TrackParams>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let Some(tok) = verify(&state, &params.t) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    metrics::counter!("tracking.reports").increment(1);

    let mut event = AdEvent::new(AdEventKind::Report, tok.r.clone(), tok.p);
    event.placement_id = Some(tok.pl.clone());
    event.line_item_id = Some(tok.l);
    event.creative_id = Some(tok.c);
    event.event_type = payload
        .get("kind")
        .and_then(|v| v.as_str())
        .map(sanitize_event_type);
    state.analytics.log(event);

    Json(serde_json::json!({"status": "ok"})).into_response()
}
