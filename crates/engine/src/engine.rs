//! Decisioning entry point: filter, rate limit, bid fan-out, price, rank,
//! select, and account the serve.

use crate::filter::{Candidate, FilterInput, SinglePassFilter};
use crate::ranking::{rank_candidates, PriorityTable};
use crate::trace::{SelectionTrace, TraceStep};
use adserve_bidder::ProgrammaticBidder;
use adserve_core::config::{EngineConfig, PacingConfig};
use adserve_core::error::AdError;
use adserve_core::types::{BudgetType, Creative, LineItem, TargetingContext};
use adserve_counters::{keys, CounterStore};
use adserve_ctr::{CtrPredictor, CtrRequest};
use adserve_delivery::pacing::PacingEvaluator;
use adserve_delivery::RateLimiter;
use adserve_store::AdStore;
use chrono::{Datelike, Local, Timelike, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// One ad opportunity to decide.
pub struct SelectAdRequest<'a> {
    pub request_id: &'a str,
    pub imp_id: &'a str,
    pub placement_id: &'a str,
    pub user_id: &'a str,
    /// 0 inherits the placement width.
    pub width: u32,
    /// 0 inherits the placement height.
    pub height: u32,
    pub targeting: &'a TargetingContext,
    /// Request-level trace opt-in; OR-ed with the engine-wide debug flag.
    pub trace: bool,
}

/// The winning creative with everything the response needs.
#[derive(Debug)]
pub struct AdSelection {
    pub creative: Arc<Creative>,
    pub line_item: Arc<LineItem>,
    pub price: f64,
    pub width: u32,
    pub height: u32,
    pub trace: Option<Vec<TraceStep>>,
}

/// A failed selection, carrying whatever trace steps were collected before
/// the failure.
#[derive(Debug)]
pub struct SelectionFailure {
    pub error: AdError,
    pub trace: Option<Vec<TraceStep>>,
}

pub struct DecisionEngine {
    store: Arc<AdStore>,
    counters: CounterStore,
    filter: SinglePassFilter,
    rate_limiter: Arc<RateLimiter>,
    bidder: ProgrammaticBidder,
    ctr: Arc<CtrPredictor>,
    priorities: PriorityTable,
    debug_trace: bool,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<AdStore>,
        counters: CounterStore,
        rate_limiter: Arc<RateLimiter>,
        bidder: ProgrammaticBidder,
        ctr: Arc<CtrPredictor>,
        engine_config: &EngineConfig,
        pacing_config: &PacingConfig,
    ) -> Self {
        let pacing = PacingEvaluator::new(counters.clone(), pacing_config.clone());
        let filter = SinglePassFilter::new(
            counters.clone(),
            pacing,
            engine_config.default_frequency_cap,
        );
        Self {
            store,
            counters,
            filter,
            rate_limiter,
            bidder,
            ctr,
            priorities: PriorityTable::new(&engine_config.priority_tiers()),
            debug_trace: engine_config.debug_trace,
        }
    }

    pub async fn select_ad(
        &self,
        request: SelectAdRequest<'_>,
    ) -> Result<AdSelection, SelectionFailure> {
        let started = Instant::now();
        metrics::counter!("engine.requests").increment(1);

        let mut trace = SelectionTrace::new(self.debug_trace || request.trace);
        let now = Utc::now();

        // Placement resolution and dimension defaulting.
        let snapshot = self.store.snapshot();
        let Some(placement) = snapshot.get_placement(request.placement_id) else {
            metrics::counter!("engine.unknown_placement").increment(1);
            return Err(SelectionFailure {
                error: AdError::UnknownPlacement(request.placement_id.to_string()),
                trace: trace.into_steps(),
            });
        };
        let width = if request.width > 0 {
            request.width
        } else {
            placement.width
        };
        let height = if request.height > 0 {
            request.height
        } else {
            placement.height
        };

        let creatives = snapshot.creatives_for_placement(request.placement_id);
        trace.step_with(
            "start",
            creatives.iter().map(|c| c.id).collect(),
            [("candidates", creatives.len().to_string())],
        );

        // Single-pass filter; PacingLimitReached propagates distinctly.
        let filtered = match self
            .filter
            .run(
                FilterInput {
                    catalog: &snapshot,
                    creatives,
                    ctx: request.targeting,
                    width,
                    height,
                    allowed_formats: &placement.allowed_formats,
                    user_id: request.user_id,
                },
                now,
                &mut trace,
            )
            .await
        {
            Ok(filtered) => filtered,
            Err(error) => {
                return Err(SelectionFailure {
                    error,
                    trace: trace.into_steps(),
                });
            }
        };
        if filtered.is_empty() {
            metrics::counter!("engine.no_ad").increment(1);
            return Err(SelectionFailure {
                error: AdError::NoAd,
                trace: trace.into_steps(),
            });
        }

        // Rate limiting, DIRECT items only; one token per line item per
        // request regardless of how many creatives it fields.
        let before_rate_limit = filtered.len();
        let mut acquired: HashMap<i64, bool> = HashMap::new();
        let mut working: Vec<Candidate> = filtered
            .into_iter()
            .filter(|candidate| {
                if candidate.line_item.is_programmatic() {
                    return true;
                }
                *acquired
                    .entry(candidate.line_item_id())
                    .or_insert_with(|| self.rate_limiter.try_acquire(candidate.line_item_id()))
            })
            .collect();
        trace.step(
            "ratelimit",
            working.iter().map(Candidate::creative_id).collect(),
        );
        if working.is_empty() {
            metrics::counter!("engine.rate_limited").increment(1);
            debug!(dropped = before_rate_limit, "All candidates rate limited");
            return Err(SelectionFailure {
                error: AdError::RateLimitReached,
                trace: trace.into_steps(),
            });
        }

        // Programmatic fan-out for the line items still in play.
        let mut seen = HashSet::new();
        let programmatic: Vec<Arc<LineItem>> = working
            .iter()
            .filter(|c| c.line_item.is_programmatic() && seen.insert(c.line_item_id()))
            .map(|c| c.line_item.clone())
            .collect();
        let bids = if programmatic.is_empty() {
            HashMap::new()
        } else {
            self.bidder
                .fetch_bids(
                    &programmatic,
                    request.request_id,
                    request.imp_id,
                    width,
                    height,
                )
                .await
        };
        if !programmatic.is_empty() {
            working.retain(|candidate| {
                !candidate.line_item.is_programmatic()
                    || bids
                        .get(&candidate.line_item_id())
                        .is_some_and(|price| *price > 0.0)
            });
            trace.step_with(
                "bids",
                working.iter().map(Candidate::creative_id).collect(),
                [
                    ("bidders", programmatic.len().to_string()),
                    (
                        "bids",
                        bids.values().filter(|p| **p > 0.0).count().to_string(),
                    ),
                ],
            );
        }
        if working.is_empty() {
            metrics::counter!("engine.no_ad").increment(1);
            return Err(SelectionFailure {
                error: AdError::NoAd,
                trace: trace.into_steps(),
            });
        }

        // Effective price per line item, computed at most once per request.
        let mut prices: HashMap<i64, f64> = HashMap::new();
        for candidate in &working {
            let line_item_id = candidate.line_item_id();
            if prices.contains_key(&line_item_id) {
                continue;
            }
            let price = self
                .effective_price(&candidate.line_item, request.targeting, &bids)
                .await;
            prices.insert(line_item_id, price);
        }

        let priced: Vec<(Candidate, f64)> = working
            .into_iter()
            .map(|candidate| {
                let price = prices
                    .get(&candidate.line_item_id())
                    .copied()
                    .unwrap_or(0.0);
                (candidate, price)
            })
            .collect();

        let ranked = rank_candidates(priced, &self.priorities, &mut rand::thread_rng());
        trace.step(
            "rank",
            ranked.iter().map(|(c, _)| c.creative_id()).collect(),
        );

        let (winner, price) = ranked
            .into_iter()
            .next()
            .expect("ranked set is non-empty here");

        // The serve counter moves strictly after ranking; this is the point
        // where peers start seeing the updated count.
        let today = keys::today();
        if let Err(e) = self
            .counters
            .incr_with_ttl(&keys::serves(winner.line_item_id(), &today), keys::DAILY_TTL)
            .await
        {
            metrics::counter!("engine.serve_counter_errors").increment(1);
            warn!(error = %e, line_item_id = winner.line_item_id(), "Serve counter increment failed");
        }

        trace.step_with(
            "selected",
            vec![winner.creative_id()],
            [("price", format!("{price:.4}"))],
        );
        metrics::counter!("engine.selected").increment(1);
        metrics::histogram!("engine.latency_us").record(started.elapsed().as_micros() as f64);

        Ok(AdSelection {
            creative: winner.creative,
            line_item: winner.line_item,
            price,
            width,
            height,
            trace: trace.into_steps(),
        })
    }

    /// Effective CPM-scale price for one line item. Programmatic items use
    /// their returned bid; DIRECT CPC items get the CTR boost when the
    /// predictor is enabled; everything else ranks on stored eCPM.
    async fn effective_price(
        &self,
        item: &LineItem,
        ctx: &TargetingContext,
        bids: &HashMap<i64, f64>,
    ) -> f64 {
        if item.is_programmatic() {
            return bids.get(&item.id).copied().unwrap_or(0.0);
        }
        let base = item.ecpm.get();
        if !self.ctr.enabled() || item.budget_type != BudgetType::Cpc {
            return base;
        }
        let now = Local::now();
        let prediction = self
            .ctr
            .predict(&CtrRequest {
                line_item_id: item.id,
                device_type: ctx.device_type.as_str().to_string(),
                country: ctx.country.clone(),
                hour_of_day: now.hour() as u8,
                day_of_week: now.weekday().num_days_from_sunday() as u8,
                publisher_id: Some(item.publisher_id),
            })
            .await;
        base * prediction.boost_multiplier
    }
}
